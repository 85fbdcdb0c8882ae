//! The capture loop.
//!
//! One thread, one fetch in flight. Each cycle either skips (capture disabled),
//! captures a frame, or fails and backs off. Every wait in here ends early
//! when settings change or the loop is stopped.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::backoff::{Backoff, DEFAULT_BACKOFF_MIN};
use crate::sentinel::Sentinel;
use crate::snapshot::Snapshot;
use crate::wake::Woken;

#[derive(Debug)]
pub enum CycleOutcome {
    /// Capture disabled or no camera configured.
    Skipped,
    Captured(Arc<Snapshot>),
}

pub struct CaptureHandle {
    sentinel: Sentinel,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop the loop and wait for the current cycle to finish.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.sentinel.wakeup().notify();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("webcam: capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

pub(crate) fn spawn(sentinel: Sentinel) -> Result<CaptureHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker = sentinel.clone();
    let worker_stop = Arc::clone(&stop);
    let join = std::thread::Builder::new()
        .name("webcam-capture".into())
        .spawn(move || run(worker, worker_stop))
        .context("spawn capture thread")?;
    Ok(CaptureHandle {
        sentinel,
        stop,
        join: Some(join),
    })
}

fn run(sentinel: Sentinel, stop: Arc<AtomicBool>) {
    let mut backoff = Backoff::new(DEFAULT_BACKOFF_MIN, sentinel.options().backoff_max);
    log::info!("webcam: capture loop started");

    while !stop.load(Ordering::Acquire) && !sentinel.is_shut_down() {
        // Read before the cycle so a settings change during it is not missed.
        let seen = sentinel.wakeup().generation();
        let started = Instant::now();

        match sentinel.capture_once() {
            Ok(outcome) => {
                backoff.reset();
                if let CycleOutcome::Captured(snapshot) = outcome {
                    log::debug!("webcam: captured {}", snapshot.id());
                }
                sentinel.report_status();
                let interval = sentinel.config().interval;
                sentinel
                    .wakeup()
                    .wait_since(seen, interval.saturating_sub(started.elapsed()));
            }
            Err(err) => {
                let delay = backoff.next_delay();
                log::warn!(
                    "webcam: capture failed, retrying in {:?}: {:#}",
                    delay,
                    err
                );
                sentinel.report_status();
                if sentinel.wakeup().wait_since(seen, delay) == Woken::Notified {
                    backoff.reset();
                }
            }
        }
    }

    log::info!("webcam: capture loop stopped");
}
