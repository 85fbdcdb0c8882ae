//! Interruptible sleep.
//!
//! The capture loop waits here between cycles. A settings update bumps the
//! generation and every waiter returns at once.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Woken {
    Notified,
    TimedOut,
}

#[derive(Default)]
pub struct Wakeup {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout` unless the generation moves past `seen`.
    ///
    /// Returns immediately with `Notified` if it already has, so a notify that
    /// lands between reading the generation and calling this is never lost.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> Woken {
        let guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        if *guard != seen {
            Woken::Notified
        } else {
            Woken::TimedOut
        }
    }

    pub fn wait(&self, timeout: Duration) -> Woken {
        let seen = self.generation();
        self.wait_since(seen, timeout)
    }
}
