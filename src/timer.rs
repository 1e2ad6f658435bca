//! Time source and cancellable delayed callbacks.
//!
//! Every deadline in the server (voting, run timeout, heartbeat loss, rehab
//! expiry) is a [`TimerHandle`] returned by [`schedule`]. Timers run on the
//! Tokio clock, so tests built with `start_paused = true` advance them
//! deterministically. [`Clock`] derives wall-clock timestamps from the same
//! monotonic source for the same reason.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wall-clock time anchored to the Tokio monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_origin: DateTime<Utc>,
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            origin: Instant::now(),
        }
    }

    /// Current time. Never goes backwards.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    /// Time left until `deadline`, zero if it already passed.
    pub fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Handle to a scheduled callback. Dropping the handle cancels the callback.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `callback` after `delay` unless the returned handle is cancelled first.
///
/// A callback that has already started is not interrupted by cancellation, so
/// callers still need to check their own state when it runs.
pub fn schedule<F, Fut>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                if !cancelled.is_cancelled() {
                    callback().await;
                }
            }
        }
    });

    TimerHandle { token }
}
