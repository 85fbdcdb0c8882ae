//! Persistence sinks.
//!
//! A sink takes snapshots that showed motion and stores them somewhere durable.
//! Every sink:
//! - claims the snapshot for its category before any physical write, so a
//!   repeated `accept` of the same snapshot is a no-op
//! - never blocks the caller: frames go through a bounded queue to one
//!   dedicated consumer thread, and a full queue drops the newest frame
//! - logs write failures and moves on (no retries)
//!
//! Stored layout, identical on every sink: `<base>/<YYYY-MM-DD>/<HH-MM-SS.mmm>.jpg`,
//! with date and time taken in the configured UTC offset.

use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;

use crate::motion::Persist;
use crate::snapshot::Snapshot;

pub mod cloud;
pub mod disk;
pub mod dropbox;
mod queue;

pub use cloud::{CloudClient, CloudConnector, CloudSink, FolderStatus};
pub use disk::DiskSink;
pub use dropbox::{DropboxClient, DropboxConnector};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Disk,
    Cloud,
}

/// What a sink did with an offered snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// Handed to the sink's writer.
    Queued,
    /// This sink category already took the snapshot earlier.
    Duplicate,
    /// Queue full or sink closed; the snapshot was dropped.
    Dropped,
}

impl Acceptance {
    /// True when the sink has (or had) the snapshot in hand.
    pub fn taken(self) -> bool {
        matches!(self, Acceptance::Queued | Acceptance::Duplicate)
    }
}

pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Offer a snapshot. Must not block on I/O.
    fn accept(&self, snapshot: &Arc<Snapshot>) -> Acceptance;

    /// Fallback sinks are skipped when an earlier sink took the snapshot.
    fn fallback_only(&self) -> bool {
        false
    }

    /// Stop accepting; frames still queued may be dropped.
    fn close(&self) {}
}

/// The sinks active for one configuration, in offer order.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink. Fallback sinks are always offered frames after the others.
    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
        self.sinks.sort_by_key(|s| s.fallback_only());
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(|s| s.kind()).collect()
    }

    pub fn close_all(&self) {
        for sink in &self.sinks {
            sink.close();
        }
    }
}

impl Persist for SinkSet {
    fn persist(&self, snapshot: &Arc<Snapshot>) {
        let mut taken = false;
        for sink in &self.sinks {
            if sink.fallback_only() && taken {
                log::debug!(
                    "webcam: {:?} sink skipped for {}, already taken",
                    sink.kind(),
                    snapshot.id()
                );
                continue;
            }
            taken |= sink.accept(snapshot).taken();
        }
    }
}

/// `YYYY-MM-DD` of `at` in `offset`.
pub fn date_folder(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

/// `HH-MM-SS.mmm.jpg` of `at` in `offset`.
pub fn frame_file_name(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset)
        .format("%H-%M-%S%.3f.jpg")
        .to_string()
}
