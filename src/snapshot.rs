//! Captured still images.
//!
//! - `Snapshot`: one fetched image: encoded bytes, capture time, decoded RGB grid,
//!   and the lazily computed diff against the previous compared frame.
//!
//! A snapshot is immutable once built. The only mutable state it carries is a
//! set of one-shot flags: the cached diff, a per-sink-category claim, and the
//! `stored` bit. All of them are write-once and safe to flip from any thread.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use image::GenericImageView;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::OnceLock;

use crate::motion::{self, DiffStats};
use crate::sink::SinkKind;

/// Bytes per decoded pixel (8-bit RGB).
pub const CHANNELS: usize = 3;

/// Last capture time handed out, in epoch milliseconds. Keeps snapshot ids
/// strictly increasing even when two captures land on the same millisecond.
static LAST_CAPTURE_MS: AtomicI64 = AtomicI64::new(i64::MIN);

pub struct Snapshot {
    id: String,
    captured_at: DateTime<Utc>,
    raw: Vec<u8>,
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    diff: OnceLock<DiffStats>,
    disk_claimed: AtomicBool,
    cloud_claimed: AtomicBool,
    stored: AtomicBool,
}

impl Snapshot {
    /// Decode `raw` and stamp it with the current time.
    pub fn capture(raw: Vec<u8>) -> Result<Self> {
        Self::decode_at(raw, next_capture_time())
    }

    /// Decode `raw` with an explicit capture time.
    pub fn decode_at(raw: Vec<u8>, captured_at: DateTime<Utc>) -> Result<Self> {
        let (pixels, width, height) = decode_image(&raw)?;
        Ok(Self::assemble(raw, pixels, width, height, captured_at))
    }

    /// Build a snapshot from an already decoded RGB grid.
    ///
    /// `raw` is kept as the encoded representation handed to sinks; it is not
    /// checked against `pixels`.
    pub fn from_rgb(
        raw: Vec<u8>,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer is {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self::assemble(raw, pixels, width, height, captured_at))
    }

    fn assemble(
        raw: Vec<u8>,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            captured_at,
            raw,
            pixels,
            width,
            height,
            diff: OnceLock::new(),
            disk_claimed: AtomicBool::new(false),
            cloud_claimed: AtomicBool::new(false),
            stored: AtomicBool::new(false),
        }
    }

    /// Opaque id derived from the capture time (RFC 3339, UTC, milliseconds).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Encoded image bytes as fetched from the source.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Decoded RGB pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Diff against `reference`, computed on first call and cached.
    ///
    /// Later calls return the cached value whatever reference they pass.
    pub fn diff_against(&self, reference: &Snapshot) -> DiffStats {
        *self
            .diff
            .get_or_init(|| motion::pixel_diff(self, reference))
    }

    /// Cached diff, if one was computed.
    pub fn diff(&self) -> Option<DiffStats> {
        self.diff.get().copied()
    }

    /// Claim this snapshot for a sink category. Returns `true` exactly once per
    /// category; every later call returns `false`.
    pub fn claim(&self, kind: SinkKind) -> bool {
        let flag = match kind {
            SinkKind::Disk => &self.disk_claimed,
            SinkKind::Cloud => &self.cloud_claimed,
        };
        !flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_claimed(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Disk => self.disk_claimed.load(Ordering::Acquire),
            SinkKind::Cloud => self.cloud_claimed.load(Ordering::Acquire),
        }
    }

    /// Record that a physical write succeeded.
    pub fn mark_stored(&self) {
        self.stored.store(true, Ordering::Release);
    }

    pub fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("raw_len", &self.raw.len())
            .field("diff", &self.diff.get())
            .field("stored", &self.is_stored())
            .finish()
    }
}

fn next_capture_time() -> DateTime<Utc> {
    let now_ms = Utc::now().timestamp_millis();
    let prev = LAST_CAPTURE_MS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now_ms.max(last.saturating_add(1)))
        })
        .unwrap_or(now_ms);
    let ms = now_ms.max(prev.saturating_add(1));
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn decode_image(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    if bytes.is_empty() {
        return Err(anyhow!("empty image"));
    }
    let image = image::load_from_memory(bytes).context("decode image")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}
