//! Pure transition function for a payment session.
//!
//! `session_transition` maps `(state, event)` to the next state plus the side effects the
//! coordinator must perform. Nothing here touches a wallet, an RPC endpoint or a timer, so the
//! whole checkout table can be exercised without any runtime.

use std::time::Duration;

use alloy::primitives::{Address, B256};
use thiserror::Error;

use crate::chain::ChainId;
use crate::domain::{ErrorKind, OrderId, SessionError, SessionStage, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    WalletConnected { address: Address },
    ChainSelected { chain: ChainId },
    /// The wallet's active chain differs from (or matches) the selected one.
    WalletChainChanged { active: u64, expected: u64 },
    WalletDisconnected,
    SubmitStarted,
    TransferSubmitted { tx_hash: B256 },
    ReceiptMined { success: bool },
    ConfirmationStuck { waited: Duration },
    OrderCreated { order_id: OrderId },
    OrderCreationFailed { message: String },
    SettlementSucceeded,
    SettlementFailed { reason: Option<String> },
    SettlementStuck { waited: Duration },
    /// Any failure that ends the current attempt.
    Abort(SessionError),
    /// Explicit retry from `Failed`, back to a pre-submission stage.
    Reset { to: SessionStage },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::WalletConnected { .. } => "wallet_connected",
            SessionEvent::ChainSelected { .. } => "chain_selected",
            SessionEvent::WalletChainChanged { .. } => "wallet_chain_changed",
            SessionEvent::WalletDisconnected => "wallet_disconnected",
            SessionEvent::SubmitStarted => "submit_started",
            SessionEvent::TransferSubmitted { .. } => "transfer_submitted",
            SessionEvent::ReceiptMined { .. } => "receipt_mined",
            SessionEvent::ConfirmationStuck { .. } => "confirmation_stuck",
            SessionEvent::OrderCreated { .. } => "order_created",
            SessionEvent::OrderCreationFailed { .. } => "order_creation_failed",
            SessionEvent::SettlementSucceeded => "settlement_succeeded",
            SessionEvent::SettlementFailed { .. } => "settlement_failed",
            SessionEvent::SettlementStuck { .. } => "settlement_stuck",
            SessionEvent::Abort(_) => "abort",
            SessionEvent::Reset { .. } => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartConfirmationPoll { tx_hash: B256 },
    CancelConfirmationPoll,
    CreateOrder { tx_hash: B256 },
    StartSettlementPoll { order_id: OrderId },
    CancelSettlementPoll,
    NotifySettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStage,
    pub next: SessionState,
    pub effects: Vec<Effect>,
    pub reason: &'static str,
}

impl Transition {
    pub fn to(&self) -> SessionStage {
        self.next.stage()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal session transition: {event} in {from:?}")]
    Illegal {
        from: SessionStage,
        event: &'static str,
    },
    #[error("session is terminal ({0:?}); no further transitions are accepted")]
    Terminal(SessionStage),
}

/// Outcome of applying `event` to `state`.
///
/// `Ok(None)` means the event is legal but has no effect in this state (for example a wallet
/// chain change that already matches the selection, or one arriving after submission).
pub fn session_transition(
    state: &SessionState,
    event: SessionEvent,
) -> Result<Option<Transition>, TransitionError> {
    let from = state.stage();
    if from.is_terminal() {
        if let (SessionState::Failed { .. }, SessionEvent::Reset { to }) = (state, &event) {
            return reset_transition(*to).map(Some);
        }
        return Err(TransitionError::Terminal(from));
    }

    let illegal = |event: &SessionEvent| TransitionError::Illegal {
        from,
        event: event.name(),
    };
    let moved = |next: SessionState,
                 effects: Vec<Effect>,
                 reason: &'static str|
     -> Result<Option<Transition>, TransitionError> {
        Ok(Some(Transition {
            from,
            next,
            effects,
            reason,
        }))
    };

    match (state, event) {
        (SessionState::Disconnected, SessionEvent::WalletConnected { .. }) => {
            moved(SessionState::Connected, vec![], "wallet_connected")
        }
        (
            SessionState::Connected | SessionState::ChainSelected,
            SessionEvent::ChainSelected { .. },
        ) => moved(SessionState::ChainSelected, vec![], "chain_selected"),
        (SessionState::ChainSelected, SessionEvent::WalletChainChanged { active, expected }) => {
            if active == expected {
                Ok(None)
            } else {
                moved(SessionState::Connected, vec![], "chain_changed_out_of_band")
            }
        }
        (
            SessionState::Disconnected | SessionState::Connected,
            SessionEvent::WalletChainChanged { .. },
        ) => Ok(None),
        // Already submitted against the previously valid chain.
        (_, SessionEvent::WalletChainChanged { .. }) if from.is_post_submission() => Ok(None),
        (
            SessionState::Connected | SessionState::ChainSelected,
            SessionEvent::WalletDisconnected,
        ) => moved(SessionState::Disconnected, vec![], "wallet_disconnected"),
        (SessionState::Disconnected, SessionEvent::WalletDisconnected) => Ok(None),
        (_, SessionEvent::WalletDisconnected) if from.is_post_submission() => Ok(None),
        (SessionState::ChainSelected, SessionEvent::SubmitStarted) => {
            moved(SessionState::Submitting, vec![], "submit_started")
        }
        (SessionState::Submitting, SessionEvent::TransferSubmitted { tx_hash }) => moved(
            SessionState::AwaitingConfirmation { tx_hash },
            vec![Effect::StartConfirmationPoll { tx_hash }],
            "transfer_submitted",
        ),
        (SessionState::AwaitingConfirmation { tx_hash }, SessionEvent::ReceiptMined { success }) => {
            if success {
                moved(
                    SessionState::CreatingOrder { tx_hash: *tx_hash },
                    vec![
                        Effect::CancelConfirmationPoll,
                        Effect::CreateOrder { tx_hash: *tx_hash },
                    ],
                    "receipt_mined",
                )
            } else {
                moved(
                    failed(
                        ErrorKind::OnChainRevert,
                        format!("transaction {tx_hash} reverted"),
                    ),
                    vec![Effect::CancelConfirmationPoll],
                    "on_chain_revert",
                )
            }
        }
        (
            SessionState::AwaitingConfirmation { tx_hash },
            SessionEvent::ConfirmationStuck { waited },
        ) => moved(
            failed(
                ErrorKind::ConfirmationTimeout,
                format!(
                    "no receipt for {tx_hash} after {}s",
                    waited.as_secs()
                ),
            ),
            vec![Effect::CancelConfirmationPoll],
            "confirmation_stuck",
        ),
        (SessionState::CreatingOrder { .. }, SessionEvent::OrderCreated { order_id }) => moved(
            SessionState::AwaitingSettlement {
                order_id: order_id.clone(),
            },
            vec![Effect::StartSettlementPoll { order_id }],
            "order_created",
        ),
        (SessionState::CreatingOrder { tx_hash }, SessionEvent::OrderCreationFailed { message }) => {
            moved(
                failed(
                    ErrorKind::OrderCreationFailed,
                    format!("transfer {tx_hash} confirmed but order creation failed: {message}"),
                ),
                vec![],
                "order_creation_failed",
            )
        }
        (SessionState::AwaitingSettlement { .. }, SessionEvent::SettlementSucceeded) => moved(
            SessionState::Settled,
            vec![Effect::CancelSettlementPoll, Effect::NotifySettled],
            "settled",
        ),
        (SessionState::AwaitingSettlement { order_id }, SessionEvent::SettlementFailed { reason }) => {
            moved(
                failed(
                    ErrorKind::SettlementFailed,
                    format!(
                        "order {order_id} failed to settle: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    ),
                ),
                vec![Effect::CancelSettlementPoll],
                "settlement_failed",
            )
        }
        (
            SessionState::AwaitingSettlement { order_id },
            SessionEvent::SettlementStuck { waited },
        ) => moved(
            failed(
                ErrorKind::SettlementTimeout,
                format!(
                    "order {order_id} not settled after {}s",
                    waited.as_secs()
                ),
            ),
            vec![Effect::CancelSettlementPoll],
            "settlement_stuck",
        ),
        (_, SessionEvent::Abort(error)) => moved(
            SessionState::Failed { error },
            vec![Effect::CancelConfirmationPoll, Effect::CancelSettlementPoll],
            "aborted",
        ),
        (_, event) => Err(illegal(&event)),
    }
}

fn reset_transition(to: SessionStage) -> Result<Transition, TransitionError> {
    let next = match to {
        SessionStage::Disconnected => SessionState::Disconnected,
        SessionStage::Connected => SessionState::Connected,
        SessionStage::ChainSelected => SessionState::ChainSelected,
        _ => {
            return Err(TransitionError::Illegal {
                from: SessionStage::Failed,
                event: "reset",
            })
        }
    };
    Ok(Transition {
        from: SessionStage::Failed,
        next,
        effects: vec![],
        reason: "reset",
    })
}

fn failed(kind: ErrorKind, message: String) -> SessionState {
    SessionState::Failed {
        error: SessionError::new(kind, message),
    }
}
