use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Reported after every capture cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub is_capturing: bool,
    pub last_capture_time: Option<DateTime<Utc>>,
    pub buffered_frame_count: usize,
}

pub trait StatusNotifier: Send + Sync {
    fn notify(&self, status: &CaptureStatus);
}

/// Writes each status as a debug log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn notify(&self, status: &CaptureStatus) {
        log::debug!(
            "webcam: capturing={} buffered={} last={}",
            status.is_capturing,
            status.buffered_frame_count,
            status
                .last_capture_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into())
        );
    }
}

/// Forwards every status over a channel. A hung-up receiver is ignored.
pub struct ChannelNotifier {
    tx: Mutex<Sender<CaptureStatus>>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<CaptureStatus>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl StatusNotifier for ChannelNotifier {
    fn notify(&self, status: &CaptureStatus) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(status.clone());
        }
    }
}
