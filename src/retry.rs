//! Bounded polling and retry helpers
//!
//! Every wait in the crate goes through [`Poller`]: it enforces a deadline,
//! sleeps `min(interval, remaining)` between attempts and honors cancellation
//! at each suspension point.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why a poll loop stopped without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStop {
    TimedOut,
    Cancelled,
}

impl<T> From<PollStop> for WaitOutcome<T> {
    fn from(stop: PollStop) -> Self {
        match stop {
            PollStop::TimedOut => WaitOutcome::TimedOut,
            PollStop::Cancelled => WaitOutcome::Cancelled,
        }
    }
}

/// Deadline-bound attempt scheduler.
///
/// The first [`Poller::next_attempt`] returns immediately; later calls sleep
/// until the next slot. The final attempt happens at the deadline, so a loop
/// built on this never outlives `timeout` by more than one attempt.
pub struct Poller {
    interval: Duration,
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
    first: bool,
}

impl Poller {
    pub fn new(schedule: PollSchedule, cancel: &CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            interval: schedule.interval,
            started,
            deadline: started + schedule.timeout,
            cancel: cancel.clone(),
            first: true,
        }
    }

    pub async fn next_attempt(&mut self) -> Result<(), PollStop> {
        if self.cancel.is_cancelled() {
            return Err(PollStop::Cancelled);
        }
        if self.first {
            self.first = false;
            return Ok(());
        }

        let now = Instant::now();
        if now >= self.deadline {
            return Err(PollStop::TimedOut);
        }
        let pause = self.interval.min(self.deadline - now);
        tokio::select! {
            () = self.cancel.cancelled() => Err(PollStop::Cancelled),
            () = tokio::time::sleep(pause) => Ok(()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Polls `check` until it yields a value, the schedule runs out or `cancel` fires.
pub async fn poll_until<T, E, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<WaitOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut poller = Poller::new(schedule, cancel);
    loop {
        if let Err(stop) = poller.next_attempt().await {
            return Ok(stop.into());
        }
        if let Some(value) = check().await? {
            return Ok(WaitOutcome::Ready(value));
        }
    }
}

/// Sleeps for `duration`; returns `false` if cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// A single extra attempt for transient UI visibility glitches
    pub const ONCE: RetryPolicy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_secs(1),
    };

    /// Exponential backoff: base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
///
/// A cancellation during backoff returns the last error.
pub async fn retry<T, E, F, Fut, R>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay = ?delay,
                    error = %e,
                    "Retrying after transient failure"
                );
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
