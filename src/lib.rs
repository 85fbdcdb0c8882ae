//! Webcam sentinel
//!
//! Periodically captures a still image from a network camera, compares it
//! with the previous frame, keeps a bounded history for live viewing and
//! stores the frames around detected motion on local disk and/or in cloud
//! storage.
//!
//! # Pipeline
//!
//! capture loop → `Snapshot` → `RetentionBuffer` (always) and
//! `MotionDetector` (single-flight) → on motion, reference and current frame
//! go to every active `Sink` → sinks store or drop frames on their own
//! threads, behind bounded queues.
//!
//! # Module Structure
//!
//! - `snapshot`, `motion`, `buffer`: frames, diffing, live history
//! - `sink`: disk and cloud persistence, stored-frame archive
//! - `source`: camera fetch
//! - `settings`: runtime settings and their store
//! - `sentinel`, `capture`: the orchestrator and its loop
//! - `api`, `config`: HTTP surface and daemon configuration

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod api;
pub mod backoff;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod motion;
pub mod sentinel;
pub mod settings;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod status;
pub mod wake;

pub use buffer::RetentionBuffer;
pub use capture::{CaptureHandle, CycleOutcome};
pub use error::SentinelError;
pub use motion::{DiffStats, MotionDetector, MotionState, MotionVerdict, PIXEL_NOISE_THRESHOLD};
pub use sentinel::{Sentinel, SentinelBuilder, SentinelOptions};
pub use settings::{
    JsonFileSettingsStore, MemorySettingsStore, SentinelConfig, Settings, SettingsStore,
};
pub use snapshot::Snapshot;
pub use source::{FrameSource, HttpSnapshotSource};
pub use status::{CaptureStatus, ChannelNotifier, LogNotifier, StatusNotifier};

/// One HTTP route a module serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub method: &'static str,
    pub path: &'static str,
}

/// Static description of a dashboard module, evaluated once at startup.
#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub routes: &'static [RouteDescriptor],
    /// Reports a status after every cycle.
    pub status: bool,
    /// Accepts a settings payload.
    pub settings: bool,
}

const fn route(method: &'static str, path: &'static str) -> RouteDescriptor {
    RouteDescriptor { method, path }
}

pub const WEBCAM_MODULE: ModuleDescriptor = ModuleDescriptor {
    id: "webcam",
    name: "Webcam sentinel",
    routes: &[
        route("GET", "/health"),
        route("GET", "/status"),
        route("GET", "/settings"),
        route("PUT", "/settings"),
        route("GET", "/snap"),
        route("GET", "/snap/{date}"),
        route("GET", "/snap/{date}/{time}"),
        route("GET", "/live/{index}"),
    ],
    status: true,
    settings: true,
};

/// Module ids double as settings file names: `[a-z0-9_-]{1,64}`.
pub fn validate_module_id(id: &str) -> Result<()> {
    // Compile once for hot paths.
    static MODULE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = MODULE_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(id) {
        return Err(anyhow!("module id must match ^[a-z0-9_-]{{1,64}}$: {:?}", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webcam_module_id_is_valid() {
        validate_module_id(WEBCAM_MODULE.id).unwrap();
        assert!(validate_module_id("").is_err());
        assert!(validate_module_id("../x").is_err());
        assert!(validate_module_id("Webcam").is_err());
    }

    #[test]
    fn webcam_module_declares_every_route_once() {
        let mut seen = std::collections::HashSet::new();
        for r in WEBCAM_MODULE.routes {
            assert!(seen.insert((r.method, r.path)), "duplicate {r:?}");
        }
        assert!(WEBCAM_MODULE.settings);
    }
}
