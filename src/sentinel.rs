//! The webcam sentinel: ties the frame source, retention buffer, motion
//! detector and sinks together behind one cloneable handle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::backoff::DEFAULT_BACKOFF_MAX;
use crate::buffer::{RetentionBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::capture::{self, CaptureHandle, CycleOutcome};
use crate::error::SentinelError;
use crate::motion::{MotionDetector, MotionState, Persist};
use crate::settings::{SentinelConfig, Settings};
use crate::sink::{
    disk, CloudConnector, CloudSink, DiskSink, DropboxConnector, Sink, SinkSet,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::snapshot::Snapshot;
use crate::source::{FrameSource, HttpSnapshotSource};
use crate::status::{CaptureStatus, LogNotifier, StatusNotifier};
use crate::wake::Wakeup;

#[derive(Clone, Debug)]
pub struct SentinelOptions {
    pub buffer_capacity: usize,
    pub queue_capacity: usize,
    pub backoff_max: Duration,
}

impl Default for SentinelOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

pub struct SentinelBuilder {
    source: Option<Arc<dyn FrameSource>>,
    connector: Option<Arc<dyn CloudConnector>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    options: SentinelOptions,
}

impl SentinelBuilder {
    pub fn source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn cloud_connector(mut self, connector: Arc<dyn CloudConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn options(mut self, options: SentinelOptions) -> Self {
        self.options = options;
        self
    }

    /// Build a sentinel running on default settings (capture disabled).
    pub fn build(self) -> Sentinel {
        let options = self.options;
        Sentinel {
            shared: Arc::new(Shared {
                source: self
                    .source
                    .unwrap_or_else(|| Arc::new(HttpSnapshotSource::default())),
                connector: self
                    .connector
                    .unwrap_or_else(|| Arc::new(DropboxConnector::default())),
                notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
                config: RwLock::new(Arc::new(SentinelConfig::default())),
                update: Mutex::new(()),
                buffer: RetentionBuffer::new(options.buffer_capacity),
                detector: MotionDetector::new(Arc::new(MotionState::new())),
                sinks: RwLock::new(ActiveSinks::default()),
                wakeup: Wakeup::new(),
                last_capture: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                options,
            }),
        }
    }
}

/// The sinks serving the active config. Kept typed so an update can reuse a
/// sink whose target did not change.
#[derive(Clone, Default)]
struct ActiveSinks {
    disk: Option<Arc<DiskSink>>,
    cloud: Option<Arc<CloudSink>>,
    set: Arc<SinkSet>,
}

struct Shared {
    source: Arc<dyn FrameSource>,
    connector: Arc<dyn CloudConnector>,
    notifier: Arc<dyn StatusNotifier>,
    options: SentinelOptions,
    config: RwLock<Arc<SentinelConfig>>,
    /// Serializes settings updates; readers never take it.
    update: Mutex<()>,
    buffer: RetentionBuffer,
    detector: MotionDetector,
    sinks: RwLock<ActiveSinks>,
    wakeup: Wakeup,
    last_capture: Mutex<Option<DateTime<Utc>>>,
    shutdown: AtomicBool,
}

impl Persist for Shared {
    fn persist(&self, snapshot: &Arc<Snapshot>) {
        let set = Arc::clone(
            &self
                .sinks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .set,
        );
        set.persist(snapshot);
    }
}

#[derive(Clone)]
pub struct Sentinel {
    shared: Arc<Shared>,
}

impl Sentinel {
    pub fn builder() -> SentinelBuilder {
        SentinelBuilder {
            source: None,
            connector: None,
            notifier: None,
            options: SentinelOptions::default(),
        }
    }

    pub fn options(&self) -> &SentinelOptions {
        &self.shared.options
    }

    /// The active config. Cheap; callers hold a consistent view for as long
    /// as they keep the `Arc`.
    pub fn config(&self) -> Arc<SentinelConfig> {
        Arc::clone(
            &self
                .shared
                .config
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn settings(&self) -> Settings {
        self.config().settings.clone()
    }

    /// Validate `payload` merged over the current settings and make it the
    /// active config.
    ///
    /// On a validation error nothing changes. A rejected cloud credential is
    /// not an error: it is logged and the cloud sink stays off. On success the
    /// capture loop's pending wait ends at once.
    pub fn apply_settings(&self, payload: Option<&Value>) -> Result<Settings, SentinelError> {
        let shared = &self.shared;
        let _update = shared.update.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.config();
        let merged = current.settings.merge(payload)?;
        let next = merged.normalize()?;

        let previous = shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (sinks, retired) = self.rebuild_sinks(&current, &next, &previous);

        *shared.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next.clone());
        *shared.sinks.write().unwrap_or_else(PoisonError::into_inner) = sinks;
        for sink in retired {
            sink.close();
        }
        shared.wakeup.notify();

        log::info!(
            "webcam: settings applied (capturing={}, interval={:?}, threshold={}, disk={}, cloud={})",
            next.is_capturing(),
            next.interval,
            next.threshold,
            next.disk.is_some(),
            self.cloud_active()
        );
        Ok(next.settings)
    }

    /// Start the sinks `next` needs, reusing those whose target is unchanged.
    /// Returns the new set and the sinks to close once it is live.
    fn rebuild_sinks(
        &self,
        current: &SentinelConfig,
        next: &SentinelConfig,
        previous: &ActiveSinks,
    ) -> (ActiveSinks, Vec<Arc<dyn Sink>>) {
        let capacity = self.shared.options.queue_capacity;
        let offset_changed = current.offset != next.offset;
        let mut retired: Vec<Arc<dyn Sink>> = Vec::new();

        let disk = if !offset_changed && current.disk == next.disk && previous.disk.is_some() {
            previous.disk.clone()
        } else {
            if let Some(old) = &previous.disk {
                retired.push(old.clone());
            }
            next.disk.as_ref().and_then(|target| {
                match DiskSink::spawn(&target.base, next.offset, target.force, capacity) {
                    Ok(sink) => Some(Arc::new(sink)),
                    Err(err) => {
                        log::error!("webcam: disk sink not started: {:#}", err);
                        None
                    }
                }
            })
        };

        let cloud = if !offset_changed && current.cloud == next.cloud && previous.cloud.is_some() {
            previous.cloud.clone()
        } else {
            if let Some(old) = &previous.cloud {
                retired.push(old.clone());
            }
            next.cloud.as_ref().and_then(|target| {
                let connected = self
                    .shared
                    .connector
                    .connect(&target.token)
                    .and_then(|client| {
                        CloudSink::connect(client, &target.base, next.offset, capacity)
                    });
                match connected {
                    Ok(sink) => Some(Arc::new(sink)),
                    Err(err) => {
                        log::warn!("webcam: cloud sink disabled: {:#}", err);
                        None
                    }
                }
            })
        };

        let mut set = SinkSet::new();
        if let Some(sink) = &cloud {
            set.push(sink.clone());
        }
        if let Some(sink) = &disk {
            set.push(sink.clone());
        }
        (
            ActiveSinks {
                disk,
                cloud,
                set: Arc::new(set),
            },
            retired,
        )
    }

    pub fn cloud_active(&self) -> bool {
        self.shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cloud
            .is_some()
    }

    pub fn disk_active(&self) -> bool {
        self.shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .disk
            .is_some()
    }

    /// The `index`-th most recent buffered frame (`0` is the newest).
    pub fn live_frame(&self, index: usize) -> Result<Arc<Snapshot>, SentinelError> {
        self.shared.buffer.get_by_reverse_index(index)
    }

    pub fn buffered_frames(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            is_capturing: self.config().is_capturing() && !self.is_shut_down(),
            last_capture_time: *self
                .shared
                .last_capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            buffered_frame_count: self.shared.buffer.len(),
        }
    }

    pub(crate) fn report_status(&self) {
        self.shared.notifier.notify(&self.status());
    }

    /// Dates with stored frames on disk, oldest first.
    pub fn stored_dates(&self) -> Result<Vec<String>, SentinelError> {
        let cfg = self.config();
        let target = cfg.disk.as_ref().ok_or(SentinelError::DiskDisabled)?;
        disk::list_dates(&target.base)
    }

    pub fn stored_frames(&self, date: &str) -> Result<Vec<String>, SentinelError> {
        let cfg = self.config();
        let target = cfg.disk.as_ref().ok_or(SentinelError::DiskDisabled)?;
        disk::list_frames(&target.base, date)
    }

    pub fn stored_frame(&self, date: &str, time: &str) -> Result<Vec<u8>, SentinelError> {
        let cfg = self.config();
        let target = cfg.disk.as_ref().ok_or(SentinelError::DiskDisabled)?;
        disk::read_frame(&target.base, date, time)
    }

    /// Run one capture cycle on the calling thread.
    ///
    /// Fetch and decode errors are returned for the caller's backoff. Motion
    /// detection is handed off and does not delay the return.
    pub fn capture_once(&self) -> Result<CycleOutcome> {
        let cfg = self.config();
        if !cfg.is_capturing() {
            return Ok(CycleOutcome::Skipped);
        }
        let raw = self.shared.source.fetch(&cfg)?;
        let snapshot = Arc::new(Snapshot::capture(raw)?);

        self.shared.buffer.append(Arc::clone(&snapshot));
        *self
            .shared
            .last_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.captured_at());

        let persist: Arc<dyn Persist> = self.shared.clone();
        self.shared
            .detector
            .submit(Arc::clone(&snapshot), cfg.threshold, persist);
        Ok(CycleOutcome::Captured(snapshot))
    }

    /// True while a motion comparison is running.
    pub fn is_diffing(&self) -> bool {
        self.shared.detector.state().is_busy()
    }

    /// Reference frame and single-flight token of the motion detector.
    pub fn motion_state(&self) -> &Arc<MotionState> {
        self.shared.detector.state()
    }

    /// Start the capture loop on its own thread.
    pub fn spawn(&self) -> Result<CaptureHandle> {
        capture::spawn(self.clone())
    }

    pub(crate) fn wakeup(&self) -> &Wakeup {
        &self.shared.wakeup
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the capture loop and close every sink. Frames still queued in a
    /// sink may be dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.wakeup.notify();
        let sinks = self
            .shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sinks.set.close_all();
        log::info!("webcam: sentinel shut down");
    }
}
