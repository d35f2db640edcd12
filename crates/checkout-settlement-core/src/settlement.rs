use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{OrderId, SettlementStatus};
use crate::poll::{PollPolicy, PollSchedule};
use crate::ports::OrderBackendPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementUpdate {
    Pending { attempt: u32 },
    Succeeded,
    Failed { reason: Option<String> },
    Stuck { waited: Duration },
}

/// Polls backend order status once an order exists for a confirmed transfer.
///
/// Kept apart from [`crate::ConfirmationWatcher`]: chain finality and ledger settlement fail for
/// different reasons and on different timescales, and the session reports which side failed.
#[derive(Debug)]
pub struct SettlementPoller<B> {
    backend: Arc<B>,
    policy: PollPolicy,
}

impl<B> Clone for SettlementPoller<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            policy: self.policy,
        }
    }
}

impl<B: OrderBackendPort> SettlementPoller<B> {
    pub fn new(backend: Arc<B>, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub fn watch(&self, order_id: OrderId) -> SettlementWatch<B> {
        SettlementWatch {
            backend: Arc::clone(&self.backend),
            order_id,
            schedule: self.policy.schedule(),
            finished: false,
        }
    }
}

#[derive(Debug)]
pub struct SettlementWatch<B> {
    backend: Arc<B>,
    order_id: OrderId,
    schedule: PollSchedule,
    finished: bool,
}

impl<B: OrderBackendPort> SettlementWatch<B> {
    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub async fn next(&mut self) -> Option<SettlementUpdate> {
        if self.finished {
            return None;
        }
        let Some(delay) = self.schedule.next_delay() else {
            self.finished = true;
            return Some(SettlementUpdate::Stuck {
                waited: self.schedule.elapsed(),
            });
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let attempt = self.schedule.attempts();
        match self.backend.order_status(&self.order_id).await {
            Ok(SettlementStatus::Pending) => Some(SettlementUpdate::Pending { attempt }),
            Ok(SettlementStatus::Succeeded) => {
                self.finished = true;
                debug!(order_id = %self.order_id, attempt, "order settled");
                Some(SettlementUpdate::Succeeded)
            }
            Ok(SettlementStatus::Failed { reason }) => {
                self.finished = true;
                Some(SettlementUpdate::Failed { reason })
            }
            Err(e) => {
                warn!(order_id = %self.order_id, attempt, error = %e, "order status lookup failed; still pending");
                Some(SettlementUpdate::Pending { attempt })
            }
        }
    }
}
