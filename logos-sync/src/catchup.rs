//! Gap recovery: a small state machine around one cancellable timer.
//!
//! ```text
//!            gap detected             timer fires
//!   Idle ──────────────────► PendingRetry ─────────► InFlight
//!    ▲  ◄──────────────────      ▲                     │
//!    │   contiguous drain        │   request failed    │
//!    │   (also from InFlight)    │                     │
//!    │                           └─────────────────────┤
//!    └─────────────────────────────────────────────────┘
//!                      response received
//! ```
//!
//! A gap does not trigger a request straight away: the timer gives batches
//! that are merely late a chance to arrive and close the gap, in which case
//! the contiguous drain cancels it. Failed requests retry on the same fixed
//! delay for as long as the session lives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::DEFAULT_CATCHUP_RETRY_DELAY;

/// Identifies one armed timer. Delivered back to the provider when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Cancellation handle for a scheduled timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// One-shot timer capability.
pub trait Scheduler {
    /// Arrange for `token` to be delivered back after `delay`.
    fn schedule_once(&self, delay: Duration, token: TimerToken) -> TimerHandle;
}

/// Scheduler backed by the tokio timer. Fired tokens arrive on the receiver
/// returned by [`TokioScheduler::new`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<TimerToken>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerToken>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (Self { fired }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, token: TimerToken) -> TimerHandle {
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(token);
        });
        TimerHandle::new(move || task.abort())
    }
}

#[derive(Debug)]
struct ManualTimer {
    delay: Duration,
    token: TimerToken,
    cancelled: Arc<AtomicBool>,
    fired: bool,
}

/// Scheduler that never fires on its own; tests pop due timers by hand.
/// Clones share the same timer list.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    timers: Arc<Mutex<Vec<ManualTimer>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens of timers that are neither fired nor cancelled.
    pub fn armed(&self) -> Vec<TimerToken> {
        self.lock()
            .iter()
            .filter(|t| !t.fired && !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.token)
            .collect()
    }

    pub fn armed_count(&self) -> usize {
        self.armed().len()
    }

    /// Total number of timers ever scheduled.
    pub fn scheduled_count(&self) -> usize {
        self.lock().len()
    }

    /// Delay requested for the most recent timer.
    pub fn last_delay(&self) -> Option<Duration> {
        self.lock().last().map(|t| t.delay)
    }

    /// Fire the oldest armed timer, returning its token.
    pub fn fire_next(&self) -> Option<TimerToken> {
        let mut timers = self.lock();
        let timer = timers
            .iter_mut()
            .find(|t| !t.fired && !t.cancelled.load(Ordering::SeqCst))?;
        timer.fired = true;
        Some(timer.token)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ManualTimer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, token: TimerToken) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock().push(ManualTimer {
            delay,
            token,
            cancelled: cancelled.clone(),
            fired: false,
        });
        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupState {
    /// Nothing outstanding.
    Idle,
    /// Timer armed; a request goes out when it fires.
    PendingRetry,
    /// Request sent, waiting for the response.
    InFlight,
}

pub struct CatchupController {
    state: CatchupState,
    scheduler: Box<dyn Scheduler + Send>,
    retry_delay: Duration,
    timer: Option<(TimerToken, TimerHandle)>,
    next_token: u64,
    attempts: u32,
}

impl CatchupController {
    pub fn new(scheduler: Box<dyn Scheduler + Send>) -> Self {
        Self::with_delay(scheduler, DEFAULT_CATCHUP_RETRY_DELAY)
    }

    pub fn with_delay(scheduler: Box<dyn Scheduler + Send>, retry_delay: Duration) -> Self {
        Self {
            state: CatchupState::Idle,
            scheduler,
            retry_delay,
            timer: None,
            next_token: 0,
            attempts: 0,
        }
    }

    /// A gap was found. Arms the timer unless something is already
    /// outstanding; returns whether it did.
    pub fn on_gap(&mut self) -> bool {
        if self.state != CatchupState::Idle {
            return false;
        }
        self.arm();
        self.state = CatchupState::PendingRetry;
        true
    }

    /// A batch was applied contiguously: any pending timer is pointless,
    /// and an outstanding request no longer blocks the next gap. A response
    /// that still arrives is drained like any other batch.
    pub fn on_contiguous(&mut self) {
        self.cancel_timer();
        self.state = CatchupState::Idle;
        self.attempts = 0;
    }

    /// A timer fired. Returns `true` when the caller must now issue the
    /// catchup request. Tokens of cancelled or superseded timers are ignored.
    pub fn on_timer_fired(&mut self, token: TimerToken) -> bool {
        match &self.timer {
            Some((armed, _)) if *armed == token => {}
            _ => return false,
        }
        self.timer = None;

        if self.state != CatchupState::PendingRetry {
            return false;
        }
        self.state = CatchupState::InFlight;
        self.attempts += 1;
        true
    }

    /// The outstanding request failed: retry after the fixed delay.
    pub fn on_request_failed(&mut self) {
        if self.state != CatchupState::InFlight {
            return;
        }
        self.arm();
        self.state = CatchupState::PendingRetry;
    }

    /// A response arrived. Back to idle; the caller drains and may re-arm.
    pub fn on_response(&mut self) {
        self.cancel_timer();
        self.state = CatchupState::Idle;
        self.attempts = 0;
    }

    /// Drop any pending timer and forget the outstanding request.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.state = CatchupState::Idle;
        self.attempts = 0;
    }

    pub fn state(&self) -> CatchupState {
        self.state
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Requests issued since the last successful response.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn arm(&mut self) {
        if self.timer.is_some() {
            return;
        }
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let handle = self.scheduler.schedule_once(self.retry_delay, token);
        self.timer = Some((token, handle));
    }

    fn cancel_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.cancel();
        }
    }
}
