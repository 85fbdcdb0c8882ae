use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::snapshot::Snapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PushError {
    Full,
    Closed,
}

/// Bounded FIFO of snapshots drained by one dedicated thread.
///
/// `try_push` never blocks: a full queue rejects the new snapshot and leaves
/// the queued ones alone.
pub(crate) struct FrameQueue {
    tx: Mutex<Option<SyncSender<Arc<Snapshot>>>>,
    active: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl FrameQueue {
    pub(crate) fn spawn<F>(name: &str, capacity: usize, mut handle: F) -> Result<Self>
    where
        F: FnMut(Arc<Snapshot>) + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel::<Arc<Snapshot>>(capacity);
        let active = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_active = Arc::clone(&active);
        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for snapshot in rx {
                    worker_pending.fetch_sub(1, Ordering::AcqRel);
                    if !worker_active.load(Ordering::Acquire) {
                        continue;
                    }
                    handle(snapshot);
                }
            })
            .with_context(|| format!("spawn {} thread", name))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            active,
            pending,
            worker: Mutex::new(Some(worker)),
            capacity,
        })
    }

    pub(crate) fn try_push(&self, snapshot: Arc<Snapshot>) -> Result<(), PushError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return Err(PushError::Closed);
        };
        // Count before sending so the consumer's decrement never underflows.
        self.pending.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match err {
                    TrySendError::Full(_) => Err(PushError::Full),
                    TrySendError::Disconnected(_) => Err(PushError::Closed),
                }
            }
        }
    }

    /// Snapshots queued and not yet picked up by the consumer.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting and discard whatever is still queued. Does not wait for
    /// an in-flight write.
    pub(crate) fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Stop accepting, let the consumer finish everything queued, and join it.
    pub(crate) fn drain(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("sink worker thread panicked");
            }
        }
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.close();
    }
}
