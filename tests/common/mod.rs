#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use webcam_sentinel::sink::{CloudClient, CloudConnector, FolderStatus};
use webcam_sentinel::{FrameSource, SentinelConfig};

pub const SIDE: u32 = 16;

/// A 16x16 PNG: dark background, the first `changed` pixels bright.
pub fn frame_png(changed: usize) -> Vec<u8> {
    let mut pixels = vec![10u8; (SIDE * SIDE * 3) as usize];
    for px in pixels.chunks_exact_mut(3).take(changed) {
        px.copy_from_slice(&[250, 250, 250]);
    }
    let img = image::RgbImage::from_raw(SIDE, SIDE, pixels).expect("rgb buffer");
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("encode png");
    out
}

/// Hands out queued results in order; fails once the script runs out.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<u8>, String>>>,
    fetches: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_frame(&self, bytes: Vec<u8>) {
        self.script.lock().unwrap().push_back(Ok(bytes));
    }

    pub fn push_failure(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetches.lock().unwrap().clone()
    }
}

impl FrameSource for ScriptedSource {
    fn fetch(&self, _cfg: &SentinelConfig) -> Result<Vec<u8>> {
        self.fetches.lock().unwrap().push(Instant::now());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("camera offline")),
        }
    }
}

#[derive(Default)]
pub struct CloudRecorder {
    pub uploads: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
}

impl CloudRecorder {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

struct RecordingClient {
    rec: Arc<CloudRecorder>,
}

impl CloudClient for RecordingClient {
    fn account_name(&self) -> Result<String> {
        Ok("test account".into())
    }

    fn create_folder(&self, _path: &str) -> Result<FolderStatus> {
        Ok(FolderStatus::Created)
    }

    fn upload(&self, path: &str, _bytes: &[u8]) -> Result<()> {
        self.rec.uploads.lock().unwrap().push(path.to_string());
        Ok(())
    }
}

/// Accepts any token except "revoked".
pub struct RecordingConnector {
    pub rec: Arc<CloudRecorder>,
}

impl CloudConnector for RecordingConnector {
    fn connect(&self, token: &str) -> Result<Arc<dyn CloudClient>> {
        self.rec.connects.fetch_add(1, Ordering::SeqCst);
        if token == "revoked" {
            return Err(anyhow!("invalid_access_token"));
        }
        Ok(Arc::new(RecordingClient {
            rec: Arc::clone(&self.rec),
        }))
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
