//! Reconnection scheduler
//!
//! Owns the single optional reconnection timer of a session.
//!
//! - **No timer / one timer**: the pending attempt is an `Option` of a task
//!   handle. Arming aborts whatever was there first.
//! - **Generations**: a user-initiated teardown bumps the generation. Arming
//!   with a stale generation is refused, so an attempt that was already running
//!   when the user disconnected cannot schedule another one.
//! - **Firing**: the timer task removes itself from the slot before running
//!   the attempt, so the attempt may freely cancel or re-arm.
//!
//! The scheduler knows nothing about connecting; the session hands it the
//! future to run when the delay elapses.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Instrumentation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    /// Timers armed over the scheduler's lifetime
    pub armed: u64,
    /// Timers cancelled before they fired
    pub cancelled: u64,
    /// Timers that fired and ran their attempt
    pub fired: u64,
    /// Highest number of simultaneously pending timers ever observed
    pub max_pending: u64,
    /// Whether a timer is pending right now
    pub pending: bool,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    generation: u64,
    next_timer_id: u64,
    pending: Option<PendingTimer>,
    stats: ReconnectStats,
}

impl SchedulerState {
    fn clear_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(timer) => {
                timer.handle.abort();
                self.stats.cancelled += 1;
                self.stats.pending = false;
                true
            }
            None => false,
        }
    }
}

/// Single-timer reconnection scheduler
#[derive(Clone, Default)]
pub struct ReconnectScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current generation; captured by anything that may later want to arm
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether a timer is pending
    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Instrumentation snapshot
    pub fn stats(&self) -> ReconnectStats {
        self.lock().stats
    }

    /// Arm a timer that runs `attempt` after `delay`.
    ///
    /// Any pending timer is cancelled first. Refused (returns `false`) when
    /// `generation` is stale. `on_armed` runs under the scheduler lock right
    /// after arming, which orders it against [`cancel_all`](Self::cancel_all).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F>(
        &self,
        generation: u64,
        delay: Duration,
        attempt: F,
        on_armed: impl FnOnce(),
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.arm_inner(generation, delay, attempt, on_armed, true)
    }

    /// Like [`arm`](Self::arm), but a no-op when a timer is already pending
    pub fn arm_if_idle<F>(
        &self,
        generation: u64,
        delay: Duration,
        attempt: F,
        on_armed: impl FnOnce(),
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.arm_inner(generation, delay, attempt, on_armed, false)
    }

    fn arm_inner<F>(
        &self,
        generation: u64,
        delay: Duration,
        attempt: F,
        on_armed: impl FnOnce(),
        replace: bool,
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if state.generation != generation {
            trace!(
                current = state.generation,
                requested = generation,
                "Refusing to arm reconnect timer for a stale generation"
            );
            return false;
        }
        if state.pending.is_some() && !replace {
            trace!("Reconnect timer already pending");
            return false;
        }

        state.clear_pending();
        let id = state.next_timer_id;
        state.next_timer_id += 1;

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.take_fired(id) {
                attempt.await;
            }
        });

        state.pending = Some(PendingTimer { id, handle });
        let stats = &mut state.stats;
        stats.armed += 1;
        stats.pending = true;
        let outstanding = stats.armed - stats.cancelled - stats.fired;
        stats.max_pending = stats.max_pending.max(outstanding);
        debug!(?delay, timer = id, "Reconnect timer armed");

        on_armed();
        true
    }

    /// Cancel the pending timer, keeping the generation
    pub fn cancel(&self) -> bool {
        let cancelled = self.lock().clear_pending();
        if cancelled {
            debug!("Reconnect timer cancelled");
        }
        cancelled
    }

    /// Cancel the pending timer and invalidate every outstanding generation
    ///
    /// `then` runs under the scheduler lock after the bump.
    pub fn cancel_all(&self, then: impl FnOnce()) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        if state.clear_pending() {
            debug!("Reconnect timer cancelled");
        }
        then();
        state.generation
    }

    /// Run `f` under the scheduler lock if `generation` is still current
    pub fn if_current(&self, generation: u64, f: impl FnOnce()) -> bool {
        let state = self.lock();
        if state.generation != generation {
            return false;
        }
        f();
        drop(state);
        true
    }

    fn take_fired(&self, id: u64) -> bool {
        let mut state = self.lock();
        match &state.pending {
            Some(timer) if timer.id == id => {
                state.pending = None;
                state.stats.fired += 1;
                state.stats.pending = false;
                trace!(timer = id, "Reconnect timer fired");
                true
            }
            _ => false,
        }
    }
}
