//! Local disk sink and the read side of the stored-frame archive.

use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::queue::{FrameQueue, PushError};
use super::{date_folder, frame_file_name, Acceptance, Sink, SinkKind};
use crate::error::SentinelError;
use crate::snapshot::Snapshot;

pub struct DiskSink {
    base: PathBuf,
    force: bool,
    queue: FrameQueue,
}

impl DiskSink {
    /// Start the writer thread for `base`.
    ///
    /// Unless `force` is set the sink is a fallback: it only writes frames no
    /// cloud sink took.
    pub fn spawn(
        base: impl Into<PathBuf>,
        offset: FixedOffset,
        force: bool,
        capacity: usize,
    ) -> Result<Self> {
        let base = base.into();
        let writer_base = base.clone();
        let queue = FrameQueue::spawn("disk-sink", capacity, move |snapshot| {
            match write_frame(&writer_base, offset, &snapshot) {
                Ok(path) => {
                    snapshot.mark_stored();
                    log::info!(
                        "disk sink: wrote {} ({} px changed)",
                        path.display(),
                        snapshot
                            .diff()
                            .map(|d| d.pixels_over_threshold)
                            .unwrap_or(0)
                    );
                }
                Err(err) => log::warn!("disk sink: write {} failed: {:#}", snapshot.id(), err),
            }
        })?;
        Ok(Self { base, force, queue })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Write everything queued, then stop.
    pub fn drain(&self) {
        self.queue.drain();
    }
}

impl Sink for DiskSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Disk
    }

    fn accept(&self, snapshot: &Arc<Snapshot>) -> Acceptance {
        if !snapshot.claim(SinkKind::Disk) {
            return Acceptance::Duplicate;
        }
        match self.queue.try_push(Arc::clone(snapshot)) {
            Ok(()) => Acceptance::Queued,
            Err(PushError::Full) => {
                log::warn!("disk sink: queue full, dropped {}", snapshot.id());
                Acceptance::Dropped
            }
            Err(PushError::Closed) => {
                log::warn!("disk sink: closed, dropped {}", snapshot.id());
                Acceptance::Dropped
            }
        }
    }

    fn fallback_only(&self) -> bool {
        !self.force
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// Write one snapshot under `base/<date>/<time>.jpg`, creating the date
/// directory on first use.
pub fn write_frame(base: &Path, offset: FixedOffset, snapshot: &Snapshot) -> Result<PathBuf> {
    let dir = base.join(date_folder(snapshot.captured_at(), offset));
    match fs::metadata(&dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(anyhow!("{} exists and is not a directory", dir.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => match fs::create_dir(&dir) {
            Ok(()) => log::info!("disk sink: created {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", dir.display()));
            }
        },
        Err(err) => return Err(err).with_context(|| format!("stat {}", dir.display())),
    }
    let path = dir.join(frame_file_name(snapshot.captured_at(), offset));
    fs::write(&path, snapshot.raw()).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

// ----------------------------------------------------------------------------
// Archive: read access to stored frames
// ----------------------------------------------------------------------------

pub fn validate_date(date: &str) -> Result<(), SentinelError> {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = DATE_RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
    if !re.is_match(date) {
        return Err(SentinelError::InvalidPath(date.to_string()));
    }
    Ok(())
}

/// Accepts `HH-MM-SS.mmm` or `HH-MM-SS.mmm.jpg`; returns the file name.
pub fn validate_frame_name(time: &str) -> Result<String, SentinelError> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIME_RE
        .get_or_init(|| Regex::new(r"^\d{2}-\d{2}-\d{2}\.\d{3}(\.jpg)?$").unwrap());
    if !re.is_match(time) {
        return Err(SentinelError::InvalidPath(time.to_string()));
    }
    if time.ends_with(".jpg") {
        Ok(time.to_string())
    } else {
        Ok(format!("{time}.jpg"))
    }
}

/// Date folders under `base`, oldest first.
pub fn list_dates(base: &Path) -> Result<Vec<String>, SentinelError> {
    let mut dates = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if validate_date(&name).is_ok() {
            dates.push(name);
        }
    }
    dates.sort();
    Ok(dates)
}

/// Frame file names stored for `date`, oldest first.
pub fn list_frames(base: &Path, date: &str) -> Result<Vec<String>, SentinelError> {
    validate_date(date)?;
    let dir = base.join(date);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(SentinelError::NotFound(date.to_string()))
        }
        Err(err) => return Err(err.into()),
    };
    let mut frames = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_file() && validate_frame_name(&name).is_ok() {
            frames.push(name);
        }
    }
    frames.sort();
    Ok(frames)
}

pub fn read_frame(base: &Path, date: &str, time: &str) -> Result<Vec<u8>, SentinelError> {
    validate_date(date)?;
    let file = validate_frame_name(time)?;
    let path = base.join(date).join(file);
    match fs::read(&path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(SentinelError::NotFound(format!("{date}/{time}")))
        }
        Err(err) => Err(err.into()),
    }
}
