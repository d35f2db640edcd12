use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cadence and give-up policy for a polling loop.
///
/// The delay starts at `interval` and is multiplied by `backoff_factor` after every check, capped
/// at `max_interval`. Once `max_wait` has elapsed without a terminal answer the loop reports
/// `Stuck`; `max_wait: None` polls forever at the configured cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    /// Fixed cadence, never gives up.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff_factor: 1.0,
            max_interval: interval,
            max_wait: None,
        }
    }

    pub fn confirmation_default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            backoff_factor: 1.5,
            max_interval: Duration::from_secs(15),
            max_wait: Some(Duration::from_secs(10 * 60)),
        }
    }

    pub fn settlement_default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            backoff_factor: 1.5,
            max_interval: Duration::from_secs(20),
            max_wait: Some(Duration::from_secs(15 * 60)),
        }
    }

    pub(crate) fn schedule(&self) -> PollSchedule {
        PollSchedule {
            policy: *self,
            attempts: 0,
            started: Instant::now(),
            current: self.interval,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PollSchedule {
    policy: PollPolicy,
    attempts: u32,
    started: Instant,
    current: Duration,
}

impl PollSchedule {
    /// Delay before the next check, or `None` once `max_wait` is exhausted.
    /// The first check runs immediately.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_wait) = self.policy.max_wait {
            if self.started.elapsed() >= max_wait {
                return None;
            }
        }
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts == 1 {
            return Some(Duration::ZERO);
        }
        let delay = self.current;
        let cap = self.policy.max_interval.max(self.policy.interval);
        let factor = self.policy.backoff_factor.max(1.0);
        // Products that do not fit a `Duration` (infinite factor, huge interval) saturate at the cap.
        self.current = Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(cap, |grown| grown.min(cap));
        Some(delay)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollStage {
    Confirmation,
    Settlement,
}

/// Ownership of a running poll task. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct PollHandle {
    stage: PollStage,
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn new(stage: PollStage, epoch: u64, task: JoinHandle<()>) -> Self {
        Self {
            stage,
            epoch,
            task: Some(task),
        }
    }

    pub fn stage(&self) -> PollStage {
        self.stage
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Gives up ownership without aborting; used when the task itself reached a terminal
    /// result and is finishing on its own.
    pub fn release(mut self) {
        self.task.take();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One slot per stage; installing into an occupied slot cancels the previous occupant.
#[derive(Debug, Default)]
pub struct PollSlots {
    confirmation: Option<PollHandle>,
    settlement: Option<PollHandle>,
    next_epoch: u64,
}

impl PollSlots {
    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch = self.next_epoch.saturating_add(1);
        self.next_epoch
    }

    pub fn install(&mut self, handle: PollHandle) {
        if let Some(previous) = self.slot_mut(handle.stage()).replace(handle) {
            previous.cancel();
        }
    }

    /// Clears a stage. The calling task's own handle is released rather than aborted.
    pub fn clear(&mut self, stage: PollStage, caller_epoch: Option<u64>) {
        if let Some(handle) = self.slot_mut(stage).take() {
            if Some(handle.epoch()) == caller_epoch {
                handle.release();
            } else {
                handle.cancel();
            }
        }
    }

    pub fn cancel_all(&mut self) {
        self.clear(PollStage::Confirmation, None);
        self.clear(PollStage::Settlement, None);
    }

    pub fn current_epoch(&self, stage: PollStage) -> Option<u64> {
        self.slot(stage).map(PollHandle::epoch)
    }

    pub fn active(&self, stage: PollStage) -> usize {
        usize::from(self.slot(stage).is_some())
    }

    fn slot(&self, stage: PollStage) -> Option<&PollHandle> {
        match stage {
            PollStage::Confirmation => self.confirmation.as_ref(),
            PollStage::Settlement => self.settlement.as_ref(),
        }
    }

    fn slot_mut(&mut self, stage: PollStage) -> &mut Option<PollHandle> {
        match stage {
            PollStage::Confirmation => &mut self.confirmation,
            PollStage::Settlement => &mut self.settlement,
        }
    }
}
