use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tracing::{debug, warn};

use crate::poll::{PollPolicy, PollSchedule};
use crate::ports::ChainRpcPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationUpdate {
    Pending { attempt: u32 },
    Mined { success: bool },
    /// No receipt within the policy's `max_wait`.
    Stuck { waited: Duration },
}

/// Polls the chain RPC for a submitted transaction's receipt.
#[derive(Debug)]
pub struct ConfirmationWatcher<R> {
    rpc: Arc<R>,
    policy: PollPolicy,
}

impl<R> Clone for ConfirmationWatcher<R> {
    fn clone(&self) -> Self {
        Self {
            rpc: Arc::clone(&self.rpc),
            policy: self.policy,
        }
    }
}

impl<R: ChainRpcPort> ConfirmationWatcher<R> {
    pub fn new(rpc: Arc<R>, policy: PollPolicy) -> Self {
        Self { rpc, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Starts a fresh receipt sequence; nothing is queried until the first `next()`.
    pub fn watch(&self, tx_hash: B256) -> ConfirmationWatch<R> {
        ConfirmationWatch {
            rpc: Arc::clone(&self.rpc),
            tx_hash,
            schedule: self.policy.schedule(),
            finished: false,
        }
    }
}

/// Lazy receipt sequence for one transaction. Ends after the first `Mined` or `Stuck`.
#[derive(Debug)]
pub struct ConfirmationWatch<R> {
    rpc: Arc<R>,
    tx_hash: B256,
    schedule: PollSchedule,
    finished: bool,
}

impl<R: ChainRpcPort> ConfirmationWatch<R> {
    pub fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    pub async fn next(&mut self) -> Option<ConfirmationUpdate> {
        if self.finished {
            return None;
        }
        let Some(delay) = self.schedule.next_delay() else {
            self.finished = true;
            return Some(ConfirmationUpdate::Stuck {
                waited: self.schedule.elapsed(),
            });
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let attempt = self.schedule.attempts();
        match self.rpc.transaction_receipt(self.tx_hash).await {
            Ok(Some(receipt)) => {
                self.finished = true;
                debug!(tx_hash = %self.tx_hash, attempt, success = receipt.success, "receipt found");
                Some(ConfirmationUpdate::Mined {
                    success: receipt.success,
                })
            }
            Ok(None) => Some(ConfirmationUpdate::Pending { attempt }),
            Err(e) => {
                warn!(tx_hash = %self.tx_hash, attempt, error = %e, "receipt lookup failed; still pending");
                Some(ConfirmationUpdate::Pending { attempt })
            }
        }
    }
}
