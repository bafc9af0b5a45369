//! Time source and delay primitive used between retry attempts.
//!
//! The retry loop never calls `Instant::now()` or sleeps directly; it goes
//! through a [`Clock`] so tests can substitute a [`VirtualClock`] and observe
//! every backoff deterministically.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use asupersync::Cx;
use asupersync::time::{sleep, wall_now};

/// Future returned by [`Clock::sleep`].
pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Longest stretch a [`SystemClock`] sleep runs without looking at `cx`.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pluggable time source and scheduler.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend the calling task for `duration`.
    ///
    /// Completes early once cancellation is requested on `cx`; callers check
    /// `cx` afterwards to tell the two apart.
    fn sleep(&self, cx: &Cx, duration: Duration) -> Sleep<'_>;
}

/// Wall clock backed by the asupersync timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, cx: &Cx, duration: Duration) -> Sleep<'_> {
        let cx = cx.clone();
        let deadline = Instant::now() + duration;
        Box::pin(async move {
            loop {
                if cx.is_cancel_requested() {
                    return;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return;
                }
                let now = cx
                    .timer_driver()
                    .map_or_else(wall_now, |driver| driver.now());
                sleep(now, remaining.min(CANCEL_POLL_INTERVAL)).await;
            }
        })
    }
}

/// Deterministic clock for tests.
///
/// `sleep` completes immediately and advances virtual time by the requested
/// duration. Every requested delay is recorded.
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    inner: Mutex<VirtualState>,
}

#[derive(Debug, Default)]
struct VirtualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Mutex::new(VirtualState::default()),
        }
    }

    /// Move virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.state().elapsed += duration;
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state().elapsed
    }

    /// Every delay requested through [`Clock::sleep`], in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.state().elapsed
    }

    fn sleep(&self, _cx: &Cx, duration: Duration) -> Sleep<'_> {
        {
            let mut state = self.state();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        Box::pin(std::future::ready(()))
    }
}
