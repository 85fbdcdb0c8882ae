mod common;

use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use webcam_sentinel::api::{ApiConfig, ApiHandle, ApiServer};
use webcam_sentinel::{
    CycleOutcome, MemorySettingsStore, Sentinel, SettingsStore, WEBCAM_MODULE,
};

use common::{frame_png, wait_for, ScriptedSource};

struct TestApi {
    dir: TempDir,
    sentinel: Sentinel,
    source: Arc<ScriptedSource>,
    store: Arc<MemorySettingsStore>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let source = ScriptedSource::new();
        let sentinel = Sentinel::builder().source(source.clone()).build();
        let store = Arc::new(MemorySettingsStore::new());

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, sentinel.clone())
            .with_settings_store(store.clone())
            .spawn()?;

        Ok(Self {
            dir,
            sentinel,
            source,
            store,
            api_handle: Some(api_handle),
        })
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<Response> {
        let addr = self.api_handle.as_ref().expect("api running").addr;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<Response> {
        self.request("GET", path, None)
    }

    fn put_settings(&self, body: Value) -> Result<Response> {
        self.request("PUT", "/settings", Some(&body.to_string()))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
        self.sentinel.shutdown();
    }
}

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

#[test]
fn health_and_status() -> Result<()> {
    let api = TestApi::new()?;
    let health = api.get("/health")?;
    assert_eq!(health.status, 200);
    assert_eq!(health.json(), json!({ "status": "ok" }));

    let status = api.get("/status")?;
    assert_eq!(status.status, 200);
    let body = status.json();
    assert_eq!(body["isCapturing"], false);
    assert_eq!(body["bufferedFrameCount"], 0);
    assert_eq!(body["diskActive"], false);
    Ok(())
}

#[test]
fn settings_round_trip_and_are_saved() -> Result<()> {
    let api = TestApi::new()?;
    let defaults = api.get("/settings")?.json();
    assert_eq!(defaults["interval"], "1s");
    assert_eq!(defaults["threshold"], 4000);

    let updated = api.put_settings(json!({
        "enabled": true,
        "host": "cam.local",
        "interval": 0,
        "threshold": 300,
    }))?;
    assert_eq!(updated.status, 200);
    let body = updated.json();
    assert_eq!(body["interval"], "100ms");
    assert_eq!(body["threshold"], 300);

    assert_eq!(api.get("/settings")?.json(), body);
    assert_eq!(api.store.get(WEBCAM_MODULE.id)?, Some(body));
    assert!(api.sentinel.config().is_capturing());
    Ok(())
}

#[test]
fn invalid_settings_are_rejected_and_not_saved() -> Result<()> {
    let api = TestApi::new()?;
    let missing = api.dir.path().join("missing");
    let rejected = api.put_settings(json!({ "diskBase": missing.display().to_string() }))?;
    assert_eq!(rejected.status, 400);
    assert!(rejected.json()["error"]
        .as_str()
        .unwrap()
        .contains("diskBase"));

    let garbage = api.request("PUT", "/settings", Some("{not json"))?;
    assert_eq!(garbage.status, 400);

    assert!(api.store.get(WEBCAM_MODULE.id)?.is_none());
    assert!(api.sentinel.config().disk.is_none());
    Ok(())
}

#[test]
fn live_frames_by_reverse_index() -> Result<()> {
    let api = TestApi::new()?;
    api.put_settings(json!({ "enabled": true, "host": "cam.local", "interval": "250ms" }))?;
    let older = frame_png(1);
    let newer = frame_png(2);
    api.source.push_frame(older.clone());
    api.source.push_frame(newer.clone());
    for _ in 0..2 {
        assert!(matches!(
            api.sentinel.capture_once()?,
            CycleOutcome::Captured(_)
        ));
        assert!(wait_for(Duration::from_secs(5), || !api.sentinel.is_diffing()));
    }

    let latest = api.get("/live/0")?;
    assert_eq!(latest.status, 200);
    assert_eq!(latest.body, newer);
    assert_eq!(latest.header("Content-Type").as_deref(), Some("image/png"));
    assert_eq!(latest.header("Interval-Millis").as_deref(), Some("250"));
    assert_eq!(api.get("/live/1")?.body, older);

    assert_eq!(api.get("/live/2")?.status, 400);
    assert_eq!(api.get("/live/-1")?.status, 400);
    assert_eq!(api.get("/live/abc")?.status, 400);
    Ok(())
}

#[test]
fn stored_frames_are_served_from_disk() -> Result<()> {
    let api = TestApi::new()?;
    assert_eq!(api.get("/snap")?.status, 404);

    let day = api.dir.path().join("2024-02-29");
    std::fs::create_dir(&day)?;
    std::fs::write(day.join("13-05-09.250.jpg"), b"\xff\xd8stored")?;
    let applied = api.put_settings(json!({ "diskBase": api.dir.path().display().to_string() }))?;
    assert_eq!(applied.status, 200);

    assert_eq!(api.get("/snap")?.json(), json!(["2024-02-29"]));
    assert_eq!(
        api.get("/snap/2024-02-29")?.json(),
        json!(["13-05-09.250.jpg"])
    );
    let frame = api.get("/snap/2024-02-29/13-05-09.250")?;
    assert_eq!(frame.status, 200);
    assert_eq!(frame.body, b"\xff\xd8stored");
    assert_eq!(frame.header("Content-Type").as_deref(), Some("image/jpeg"));

    assert_eq!(api.get("/snap/2024-02-29/13-05-10.000.jpg")?.status, 404);
    assert_eq!(api.get("/snap/2024-02-29/..%2F..%2Fetc")?.status, 400);
    assert_eq!(api.get("/snap/not-a-date")?.status, 400);
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    assert_eq!(api.get("/events")?.status, 404);
    assert_eq!(api.request("DELETE", "/settings", None)?.status, 405);
    assert_eq!(api.request("POST", "/live/0", None)?.status, 405);
    Ok(())
}

#[test]
fn every_declared_route_is_served() -> Result<()> {
    let api = TestApi::new()?;
    for route in WEBCAM_MODULE.routes {
        let path = route
            .path
            .replace("{date}", "2024-01-01")
            .replace("{time}", "00-00-00.000")
            .replace("{index}", "0");
        let body = (route.method == "PUT").then_some("{}");
        let response = api.request(route.method, &path, body)?;
        assert_ne!(response.status, 405, "{} {}", route.method, route.path);
        assert!(
            response.status != 404 || response.json()["error"] != "not_found",
            "{} {} not routed",
            route.method,
            route.path
        );
    }
    Ok(())
}
