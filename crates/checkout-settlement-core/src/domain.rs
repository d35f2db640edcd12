use std::fmt::{Display, Formatter};

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::ChainId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimestampMs(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend order identifier, opaque to the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl Display for OrderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The amount charged for a checkout, in the currency's minor units.
///
/// `12.50 USDT` is `{ minor_units: 1250, exponent: 2, currency: "USDT" }`. Fixed when the
/// session is created; the value sent to the wallet and the value reported to the backend are
/// both derived from this one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeAmount {
    pub minor_units: u64,
    pub exponent: u8,
    pub currency: String,
}

impl ChargeAmount {
    pub fn new(minor_units: u64, exponent: u8, currency: impl Into<String>) -> Self {
        Self {
            minor_units,
            exponent,
            currency: currency.into(),
        }
    }
}

impl Display for ChargeAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scale = match 10u64.checked_pow(u32::from(self.exponent)) {
            Some(scale) if self.exponent > 0 => scale,
            _ => return write!(f, "{} {}", self.minor_units, self.currency),
        };
        write!(
            f,
            "{}.{:0width$} {}",
            self.minor_units / scale,
            self.minor_units % scale,
            self.currency,
            width = usize::from(self.exponent)
        )
    }
}

/// Who is buying what; forwarded verbatim to the backend when the order is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutContext {
    pub agent_id: String,
    pub user_id: String,
    pub cart: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoWalletProvider,
    UserRejected,
    UnsupportedChain,
    ChainSwitchFailed,
    InsufficientFunds,
    TransferPreparationFailed,
    OnChainRevert,
    OrderCreationFailed,
    SettlementFailed,
    ConfirmationTimeout,
    SettlementTimeout,
    Unknown,
}

impl ErrorKind {
    /// Funds have left the wallet but the order is not known to be honoured.
    pub fn requires_manual_reconciliation(&self) -> bool {
        matches!(
            self,
            ErrorKind::OrderCreationFailed
                | ErrorKind::ConfirmationTimeout
                | ErrorKind::SettlementTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoWalletProvider => "no_wallet_provider",
            ErrorKind::UserRejected => "user_rejected",
            ErrorKind::UnsupportedChain => "unsupported_chain",
            ErrorKind::ChainSwitchFailed => "chain_switch_failed",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::TransferPreparationFailed => "transfer_preparation_failed",
            ErrorKind::OnChainRevert => "on_chain_revert",
            ErrorKind::OrderCreationFailed => "order_creation_failed",
            ErrorKind::SettlementFailed => "settlement_failed",
            ErrorKind::ConfirmationTimeout => "confirmation_timeout",
            ErrorKind::SettlementTimeout => "settlement_timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Text safe to show the buyer.
    pub fn user_message(&self) -> String {
        if self.kind.requires_manual_reconciliation() {
            return format!(
                "Your payment was sent on-chain but the order could not be completed ({}). \
                 Do not pay again; keep the transaction hash and contact support.",
                self.message
            );
        }
        match self.kind {
            ErrorKind::UserRejected => "The request was declined in your wallet. No funds were moved.".to_owned(),
            ErrorKind::OnChainRevert => format!(
                "The transfer was reverted on-chain and no tokens were moved ({}).",
                self.message
            ),
            _ => format!("Payment failed: {}. No funds were moved.", self.message),
        }
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Where a session is in the checkout flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connected,
    ChainSelected,
    Submitting,
    AwaitingConfirmation { tx_hash: B256 },
    CreatingOrder { tx_hash: B256 },
    AwaitingSettlement { order_id: OrderId },
    Settled,
    Failed { error: SessionError },
}

impl SessionState {
    pub fn stage(&self) -> SessionStage {
        match self {
            SessionState::Disconnected => SessionStage::Disconnected,
            SessionState::Connected => SessionStage::Connected,
            SessionState::ChainSelected => SessionStage::ChainSelected,
            SessionState::Submitting => SessionStage::Submitting,
            SessionState::AwaitingConfirmation { .. } => SessionStage::AwaitingConfirmation,
            SessionState::CreatingOrder { .. } => SessionStage::CreatingOrder,
            SessionState::AwaitingSettlement { .. } => SessionStage::AwaitingSettlement,
            SessionState::Settled => SessionStage::Settled,
            SessionState::Failed { .. } => SessionStage::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage().is_terminal()
    }
}

/// Field-less mirror of [`SessionState`], ordered along the checkout flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionStage {
    Disconnected,
    Connected,
    ChainSelected,
    Submitting,
    AwaitingConfirmation,
    CreatingOrder,
    AwaitingSettlement,
    Settled,
    Failed,
}

impl SessionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStage::Settled | SessionStage::Failed)
    }

    /// True once the transfer may have reached the wallet.
    pub fn is_post_submission(&self) -> bool {
        !self.is_terminal() && *self >= SessionStage::Submitting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Succeeded,
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Body of the backend `createOrder` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub agent_id: String,
    pub user_id: String,
    pub amount_minor_units: u64,
    pub currency: String,
    pub chain_id: u64,
    pub tx_hash: B256,
    pub cart: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletChange {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub sequence: u64,
    pub change: WalletChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u64,
    pub from: SessionStage,
    pub to: SessionStage,
    pub reason: String,
    pub recorded_at_ms: TimestampMs,
}

/// One checkout attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub id: SessionId,
    pub state: SessionState,
    pub selected_chain: Option<ChainId>,
    pub wallet_address: Option<Address>,
    pub transaction_hash: Option<B256>,
    pub order_id: Option<OrderId>,
    pub charge: ChargeAmount,
    pub recipient: Address,
    pub checkout: CheckoutContext,
    pub last_error: Option<SessionError>,
    pub history: Vec<TransitionRecord>,
    pub created_at_ms: TimestampMs,
    pub updated_at_ms: TimestampMs,
}

impl PaymentSession {
    pub fn new(
        id: SessionId,
        checkout: CheckoutContext,
        charge: ChargeAmount,
        recipient: Address,
        now: TimestampMs,
    ) -> Self {
        Self {
            id,
            state: SessionState::Disconnected,
            selected_chain: None,
            wallet_address: None,
            transaction_hash: None,
            order_id: None,
            charge,
            recipient,
            checkout,
            last_error: None,
            history: Vec::new(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn stage(&self) -> SessionStage {
        self.state.stage()
    }

    /// Stages visited so far, starting with the initial one.
    pub fn visited_stages(&self) -> Vec<SessionStage> {
        let mut stages = vec![SessionStage::Disconnected];
        stages.extend(self.history.iter().map(|record| record.to));
        stages
    }
}
