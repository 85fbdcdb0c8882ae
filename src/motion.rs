//! Perceptual motion detection between consecutive snapshots.
//!
//! A pixel is "changed" when the sum of its absolute red, green and blue deltas
//! exceeds [`PIXEL_NOISE_THRESHOLD`]. Motion is confirmed when the number of
//! changed pixels exceeds the configured motion threshold.
//!
//! Only one comparison runs at a time. The detector holds a single-flight token
//! in [`MotionState`]; a frame that arrives while the token is held is not
//! compared at all (it stays visible in the retention buffer).

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::snapshot::{Snapshot, CHANNELS};

/// Per-pixel cutoff on the summed RGB delta (range 0..=765).
pub const PIXEL_NOISE_THRESHOLD: u32 = 48;

/// Outcome of comparing two snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    /// False when the frames had different dimensions and were not compared.
    pub compared: bool,
    pub pixel_delta_sum: u64,
    pub pixels_over_threshold: u64,
}

/// Compare `current` against `reference` pixel by pixel.
///
/// Frames of different dimensions are not compared and report zero motion.
pub fn pixel_diff(current: &Snapshot, reference: &Snapshot) -> DiffStats {
    if current.dimensions() != reference.dimensions() {
        log::debug!(
            "webcam: frame size changed {:?} -> {:?}, skipping diff",
            reference.dimensions(),
            current.dimensions()
        );
        return DiffStats::default();
    }

    let mut stats = DiffStats {
        compared: true,
        ..DiffStats::default()
    };
    let current_px = current.pixels().chunks_exact(CHANNELS);
    let reference_px = reference.pixels().chunks_exact(CHANNELS);
    for (a, b) in current_px.zip(reference_px) {
        let delta: u32 = a
            .iter()
            .zip(b)
            .map(|(x, y)| u32::from(x.abs_diff(*y)))
            .sum();
        stats.pixel_delta_sum += u64::from(delta);
        if delta > PIXEL_NOISE_THRESHOLD {
            stats.pixels_over_threshold += 1;
        }
    }
    stats
}

/// Destination for frames that showed motion.
pub trait Persist: Send + Sync {
    fn persist(&self, snapshot: &Arc<Snapshot>);
}

// ----------------------------------------------------------------------------
// MotionState: last compared frame + single-flight token
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MotionState {
    reference: Mutex<Option<Arc<Snapshot>>>,
    busy: AtomicBool,
}

impl MotionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the single-flight token, or `None` if a comparison is running.
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightToken {
                state: Arc::clone(self),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// The frame the next comparison will run against.
    pub fn reference(&self) -> Option<Arc<Snapshot>> {
        self.reference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_reference(&self, next: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        self.reference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(next)
    }
}

/// Proof of holding the single-flight token. Released on drop, including
/// when a comparison panics.
pub struct FlightToken {
    state: Arc<MotionState>,
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        self.state.busy.store(false, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// MotionDetector
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionVerdict {
    /// No reference frame yet; the snapshot became the reference.
    Baseline,
    /// Changed pixel count at or under the threshold.
    Still(DiffStats),
    /// Changed pixel count over the threshold; both frames were persisted.
    Motion(DiffStats),
}

#[derive(Clone)]
pub struct MotionDetector {
    state: Arc<MotionState>,
}

impl MotionDetector {
    pub fn new(state: Arc<MotionState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<MotionState> {
        &self.state
    }

    /// Compare `current` on the calling thread.
    ///
    /// Returns `None` without comparing when another comparison holds the token.
    pub fn evaluate(
        &self,
        current: &Arc<Snapshot>,
        threshold: u64,
        persist: &dyn Persist,
    ) -> Option<MotionVerdict> {
        let token = self.state.try_acquire()?;
        let verdict = compare(&self.state, current, threshold, persist);
        drop(token);
        Some(verdict)
    }

    /// Compare `current` on a detached thread so the caller never waits on it.
    ///
    /// Returns `false` when the token was held and the frame was skipped.
    pub fn submit(
        &self,
        current: Arc<Snapshot>,
        threshold: u64,
        persist: Arc<dyn Persist>,
    ) -> bool {
        let Some(token) = self.state.try_acquire() else {
            log::debug!("webcam: diff in progress, {} not compared", current.id());
            return false;
        };
        let state = Arc::clone(&self.state);
        let spawned = std::thread::Builder::new()
            .name("motion-diff".into())
            .spawn(move || {
                let _token = token;
                compare(&state, &current, threshold, persist.as_ref());
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                log::error!("webcam: failed to spawn diff thread: {}", err);
                false
            }
        }
    }
}

fn compare(
    state: &MotionState,
    current: &Arc<Snapshot>,
    threshold: u64,
    persist: &dyn Persist,
) -> MotionVerdict {
    let Some(reference) = state.replace_reference(Arc::clone(current)) else {
        return MotionVerdict::Baseline;
    };
    let stats = current.diff_against(&reference);
    log::debug!(
        "webcam: diff {} -> {}: {} px over threshold",
        reference.id(),
        current.id(),
        stats.pixels_over_threshold
    );
    if stats.pixels_over_threshold > threshold {
        persist.persist(&reference);
        persist.persist(current);
        MotionVerdict::Motion(stats)
    } else {
        MotionVerdict::Still(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    const SIDE: u32 = 16;

    #[derive(Default)]
    struct RecordingPersist {
        ids: Mutex<Vec<String>>,
    }

    impl RecordingPersist {
        fn ids(&self) -> Vec<String> {
            self.ids.lock().unwrap().clone()
        }
    }

    impl Persist for RecordingPersist {
        fn persist(&self, snapshot: &Arc<Snapshot>) {
            self.ids.lock().unwrap().push(snapshot.id().to_string());
        }
    }

    fn frame(seq: i64, changed: usize) -> Arc<Snapshot> {
        frame_sized(seq, SIDE, SIDE, changed)
    }

    fn frame_sized(seq: i64, width: u32, height: u32, changed: usize) -> Arc<Snapshot> {
        let mut pixels = vec![10u8; width as usize * height as usize * CHANNELS];
        for px in pixels.chunks_exact_mut(CHANNELS).take(changed) {
            px.copy_from_slice(&[250, 250, 250]);
        }
        let at = Utc::now() + ChronoDuration::milliseconds(seq);
        Arc::new(Snapshot::from_rgb(Vec::new(), pixels, width, height, at).unwrap())
    }

    #[test]
    fn identical_frames_have_no_changed_pixels() {
        let a = frame(0, 7);
        let b = frame(1, 7);
        let stats = pixel_diff(&b, &a);
        assert!(stats.compared);
        assert_eq!(stats.pixels_over_threshold, 0);
        assert_eq!(stats.pixel_delta_sum, 0);
    }

    #[test]
    fn counts_exactly_the_pixels_over_the_noise_threshold() {
        let a = frame(0, 0);
        let b = frame(1, 37);
        let stats = pixel_diff(&b, &a);
        assert_eq!(stats.pixels_over_threshold, 37);
        assert_eq!(stats.pixel_delta_sum, 37 * 3 * 240);
    }

    #[test]
    fn small_deltas_stay_under_the_noise_threshold() {
        let a = frame(0, 0);
        let mut pixels = vec![10u8; (SIDE * SIDE) as usize * CHANNELS];
        // 16 + 16 + 16 == 48, not over the threshold.
        for px in pixels.chunks_exact_mut(CHANNELS) {
            px.copy_from_slice(&[26, 26, 26]);
        }
        let b = Snapshot::from_rgb(Vec::new(), pixels, SIDE, SIDE, Utc::now()).unwrap();
        let stats = pixel_diff(&b, &a);
        assert_eq!(stats.pixels_over_threshold, 0);
        assert_eq!(stats.pixel_delta_sum, u64::from(SIDE * SIDE) * 48);
    }

    #[test]
    fn dimension_mismatch_reports_no_motion() {
        let a = frame_sized(0, 8, 8, 0);
        let b = frame_sized(1, 16, 16, 200);
        let stats = pixel_diff(&b, &a);
        assert!(!stats.compared);
        assert_eq!(stats.pixels_over_threshold, 0);
    }

    #[test]
    fn diff_is_cached_on_the_snapshot() {
        let a = frame(0, 0);
        let b = frame(1, 10);
        let c = frame(2, 200);
        assert_eq!(b.diff_against(&a).pixels_over_threshold, 10);
        // A different reference does not recompute.
        assert_eq!(b.diff_against(&c).pixels_over_threshold, 10);
        assert_eq!(b.diff().unwrap().pixels_over_threshold, 10);
    }

    #[test]
    fn persists_both_frames_only_over_the_threshold() {
        let detector = MotionDetector::new(Arc::new(MotionState::new()));
        let persist = RecordingPersist::default();

        let first = frame(0, 0);
        assert_eq!(
            detector.evaluate(&first, 100, &persist),
            Some(MotionVerdict::Baseline)
        );

        let second = frame(1, 5);
        assert!(matches!(
            detector.evaluate(&second, 100, &persist),
            Some(MotionVerdict::Still(stats)) if stats.pixels_over_threshold == 5
        ));
        assert!(persist.ids().is_empty());

        // 150 pixels differ from the second frame's 5 changed ones, minus the 5 shared.
        let third = frame(2, 155);
        assert!(matches!(
            detector.evaluate(&third, 100, &persist),
            Some(MotionVerdict::Motion(stats)) if stats.pixels_over_threshold == 150
        ));
        assert_eq!(
            persist.ids(),
            vec![second.id().to_string(), third.id().to_string()]
        );
    }

    #[test]
    fn exactly_threshold_is_not_motion() {
        let detector = MotionDetector::new(Arc::new(MotionState::new()));
        let persist = RecordingPersist::default();
        detector.evaluate(&frame(0, 0), 20, &persist);
        let verdict = detector.evaluate(&frame(1, 20), 20, &persist);
        assert!(matches!(verdict, Some(MotionVerdict::Still(_))));
        assert!(persist.ids().is_empty());
    }

    #[test]
    fn held_token_skips_the_comparison() {
        let state = Arc::new(MotionState::new());
        let detector = MotionDetector::new(Arc::clone(&state));
        let persist = RecordingPersist::default();
        detector.evaluate(&frame(0, 0), 1, &persist);

        let token = state.try_acquire().expect("token free");
        assert!(state.try_acquire().is_none());
        let skipped = frame(1, 200);
        assert_eq!(detector.evaluate(&skipped, 1, &persist), None);
        assert!(skipped.diff().is_none());
        drop(token);

        assert!(!state.is_busy());
        assert!(detector.evaluate(&frame(2, 200), 1, &persist).is_some());
    }

    #[test]
    fn submit_runs_detached_and_releases_the_token() {
        let state = Arc::new(MotionState::new());
        let detector = MotionDetector::new(Arc::clone(&state));
        let persist: Arc<RecordingPersist> = Arc::new(RecordingPersist::default());

        assert!(detector.submit(frame(0, 0), 1, persist.clone()));
        wait_idle(&state);
        let next = frame(1, 50);
        assert!(detector.submit(Arc::clone(&next), 1, persist.clone()));
        wait_idle(&state);

        assert_eq!(persist.ids().len(), 2);
        assert_eq!(next.diff().unwrap().pixels_over_threshold, 50);
        assert_eq!(state.reference().unwrap().id(), next.id());
    }

    fn wait_idle(state: &MotionState) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while state.is_busy() {
            assert!(std::time::Instant::now() < deadline, "diff never finished");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
