//! Monotonic clock abstraction.
//!
//! The applier never calls `Instant::now()` or `thread::sleep` directly; all
//! time flows through [`Clock`], so tests can run the full timing contract
//! (progress cadence, timeout ceiling, verification backoff) on a
//! [`ManualClock`] without waiting.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::host::CommandEvent;

pub trait Clock {
    /// Elapsed time since an unspecified epoch, monotonically increasing.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);

    /// Wait up to `timeout` for the next lifecycle event.
    fn recv_event(
        &self,
        events: &Receiver<CommandEvent>,
        timeout: Duration,
    ) -> Result<CommandEvent, RecvTimeoutError>;
}

/// Wall-clock implementation backed by `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn recv_event(
        &self,
        events: &Receiver<CommandEvent>,
        timeout: Duration,
    ) -> Result<CommandEvent, RecvTimeoutError> {
        events.recv_timeout(timeout)
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
}

/// Deterministic clock: time only moves when something sleeps or waits.
///
/// Clones share the same time line, so a simulated host holding a clone sees
/// exactly the time the applier sees.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Create a clock starting at `0`.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManualState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Advance monotonic time by `dt`.
    pub fn advance(&self, dt: Duration) {
        self.with_state(|s| s.now = s.now.saturating_add(dt));
    }

    /// Every duration passed to [`Clock::sleep`], in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.with_state(|s| s.sleeps.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.with_state(|s| s.now)
    }

    fn sleep(&self, duration: Duration) {
        self.with_state(|s| {
            s.sleeps.push(duration);
            s.now = s.now.saturating_add(duration);
        });
    }

    fn recv_event(
        &self,
        events: &Receiver<CommandEvent>,
        timeout: Duration,
    ) -> Result<CommandEvent, RecvTimeoutError> {
        match events.try_recv() {
            Ok(event) => Ok(event),
            Err(TryRecvError::Empty) => {
                self.advance(timeout);
                Err(RecvTimeoutError::Timeout)
            }
            Err(TryRecvError::Disconnected) => Err(RecvTimeoutError::Disconnected),
        }
    }
}
