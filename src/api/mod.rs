//! HTTP control surface for the sentinel.
//!
//! A small blocking HTTP/1.1 server, one connection at a time. Serves the live
//! buffer, the stored-frame archive, capture status and the settings.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::SentinelError;
use crate::sentinel::Sentinel;
use crate::settings::SettingsStore;
use crate::status::CaptureStatus;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8798";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Key the settings are stored under.
    pub module_id: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            module_id: crate::WEBCAM_MODULE.id.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    sentinel: Sentinel,
    store: Option<Arc<dyn SettingsStore>>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, sentinel: Sentinel) -> Self {
        Self {
            cfg,
            sentinel,
            store: None,
        }
    }

    /// Persist every settings update accepted over HTTP.
    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("sentinel-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self, shutdown_thread) {
                    log::error!("sentinel api stopped: {}", err);
                }
            })?;

        log::info!("sentinel api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, server: &ApiServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, server) {
                    log::warn!("sentinel api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, server: &ApiServer) -> Result<()> {
    // Accepted sockets can inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    let response = route(server, &request);
    write_response(
        &mut stream,
        response.status,
        response.content_type,
        &response.headers,
        &response.body,
    )
}

struct Response {
    status: u16,
    content_type: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::raw_json(200, body),
            Err(err) => {
                log::error!("sentinel api: serialize response: {}", err);
                Self::raw_json(500, br#"{"error":"internal"}"#.to_vec())
            }
        }
    }

    fn raw_json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message });
        Self::raw_json(status, body.to_string().into_bytes())
    }

    fn image(bytes: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: image_content_type(&bytes),
            headers: Vec::new(),
            body: bytes,
        }
    }
}

impl From<SentinelError> for Response {
    fn from(err: SentinelError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            log::error!("sentinel api: {}", err);
        }
        Response::error(status, &err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(flatten)]
    capture: CaptureStatus,
    buffer_capacity: usize,
    diffing: bool,
    disk_active: bool,
    cloud_active: bool,
}

fn route(server: &ApiServer, request: &HttpRequest) -> Response {
    let sentinel = &server.sentinel;
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Response::raw_json(200, br#"{"status":"ok"}"#.to_vec()),
        ("GET", ["status"]) => Response::json(&StatusBody {
            capture: sentinel.status(),
            buffer_capacity: sentinel.options().buffer_capacity,
            diffing: sentinel.is_diffing(),
            disk_active: sentinel.disk_active(),
            cloud_active: sentinel.cloud_active(),
        }),
        ("GET", ["settings"]) => Response::json(&sentinel.settings()),
        ("PUT", ["settings"]) => put_settings(server, &request.body),
        ("GET", ["snap"]) => match sentinel.stored_dates() {
            Ok(dates) => Response::json(&dates),
            Err(err) => err.into(),
        },
        ("GET", ["snap", date]) => match sentinel.stored_frames(date) {
            Ok(frames) => Response::json(&frames),
            Err(err) => err.into(),
        },
        ("GET", ["snap", date, time]) => match sentinel.stored_frame(date, time) {
            Ok(bytes) => Response::image(bytes),
            Err(err) => err.into(),
        },
        ("GET", ["live", index]) => {
            let Ok(index) = index.parse::<usize>() else {
                return Response::error(400, &format!("invalid index: {index}"));
            };
            match sentinel.live_frame(index) {
                Ok(snapshot) => {
                    let mut response = Response::image(snapshot.raw().to_vec());
                    response.headers.push((
                        "Interval-Millis",
                        sentinel.config().interval.as_millis().to_string(),
                    ));
                    response
                        .headers
                        .push(("X-Capture-Id", snapshot.id().to_string()));
                    response
                }
                Err(err) => err.into(),
            }
        }
        (
            _,
            ["health"] | ["status"] | ["settings"] | ["snap", ..] | ["live", _],
        ) => Response::error(405, "method_not_allowed"),
        _ => Response::error(404, "not_found"),
    }
}

fn put_settings(server: &ApiServer, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => return Response::error(400, &format!("invalid json: {err}")),
    };
    let applied = match server.sentinel.apply_settings(Some(&payload)) {
        Ok(settings) => settings,
        Err(err) => return err.into(),
    };
    if let Some(store) = &server.store {
        let stored = serde_json::to_value(&applied)
            .map_err(anyhow::Error::from)
            .and_then(|value| store.set(&server.cfg.module_id, &value));
        if let Err(err) = stored {
            log::warn!("sentinel api: settings applied but not saved: {:#}", err);
        }
    }
    Response::json(&applied)
}

fn image_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else {
        "application/octet-stream"
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", &[], body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
