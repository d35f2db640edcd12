use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{OrderId, OrderRequest, ProviderEvent, ReceiptStatus, SettlementStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("policy violation: {0}")]
    Policy(String),
    #[error("no wallet provider available: {0}")]
    NoProvider(String),
    #[error("request rejected by user: {0}")]
    Rejected(String),
    #[error("wallet does not recognize chain {0:#x}")]
    UnrecognizedChain(u64),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },
}

/// Injected wallet (EIP-1193 or equivalent).
///
/// Implementations classify provider failures into the typed [`PortError`] variants; callers
/// never inspect provider message text.
#[async_trait]
pub trait WalletProviderPort: Send + Sync {
    async fn request_accounts(&self) -> Result<Vec<Address>, PortError>;
    async fn chain_id(&self) -> Result<u64, PortError>;
    async fn switch_chain(&self, chain_id: u64) -> Result<(), PortError>;
    async fn add_chain(&self, params: &Value) -> Result<(), PortError>;
    async fn send_transaction(&self, tx_payload: &Value) -> Result<B256, PortError>;
    /// Account/chain changes observed since the last drain, oldest first.
    fn drain_events(&self) -> Result<Vec<ProviderEvent>, PortError>;
}

#[async_trait]
pub trait ChainRpcPort: Send + Sync {
    /// `None` while the transaction has no receipt.
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, PortError>;
}

#[async_trait]
pub trait OrderBackendPort: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderId, PortError>;
    async fn order_status(&self, order_id: &OrderId) -> Result<SettlementStatus, PortError>;
}

pub trait ClockPort: Send + Sync {
    fn now_ms(&self) -> Result<u64, PortError>;
}
