use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chain::ChainDescriptor;
use crate::domain::{ChargeAmount, ErrorKind, SessionError};
use crate::ports::{PortError, WalletProviderPort};

alloy::sol! {
    function transfer(address to, uint256 amount) external returns (bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCause {
    UserRejected,
    InsufficientFunds,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { tx_hash: B256 },
    Rejected { cause: RejectionCause, reason: String },
    PreparationFailed { reason: String },
}

impl SubmitOutcome {
    pub fn into_error(self) -> Option<SessionError> {
        match self {
            SubmitOutcome::Submitted { .. } => None,
            SubmitOutcome::Rejected { cause, reason } => {
                let kind = match cause {
                    RejectionCause::UserRejected => ErrorKind::UserRejected,
                    RejectionCause::InsufficientFunds => ErrorKind::InsufficientFunds,
                    RejectionCause::Other => ErrorKind::Unknown,
                };
                Some(SessionError::new(kind, reason))
            }
            SubmitOutcome::PreparationFailed { reason } => Some(SessionError::new(
                ErrorKind::TransferPreparationFailed,
                reason,
            )),
        }
    }
}

/// ERC-20 `transfer` calldata.
pub fn encode_transfer(recipient: Address, amount: U256) -> Bytes {
    Bytes::from(
        transferCall {
            to: recipient,
            amount,
        }
        .abi_encode(),
    )
}

/// `eth_sendTransaction` params for paying `charge` to `recipient` on `descriptor`'s chain.
pub fn build_transfer_payload(
    descriptor: &ChainDescriptor,
    from: Address,
    recipient: Address,
    charge: &ChargeAmount,
) -> Result<Value, String> {
    if recipient == Address::ZERO {
        return Err("recipient is the zero address".to_owned());
    }
    if charge.minor_units == 0 {
        return Err("charge amount is zero".to_owned());
    }
    if !charge.currency.eq_ignore_ascii_case(descriptor.token_symbol) {
        return Err(format!(
            "charge is in {} but {} settles in {}",
            charge.currency, descriptor.display_name, descriptor.token_symbol
        ));
    }
    let amount = descriptor.token_units(charge).map_err(|e| e.to_string())?;
    Ok(json!({
        "from": from,
        "to": descriptor.token_contract,
        "data": encode_transfer(recipient, amount),
        "value": "0x0",
        "chainId": descriptor.id.hex_id(),
    }))
}

/// Hands a single token transfer to the wallet. Returns as soon as the wallet reports a hash.
#[derive(Debug)]
pub struct TransferSubmitter<W> {
    provider: Arc<W>,
}

impl<W: WalletProviderPort> TransferSubmitter<W> {
    pub fn new(provider: Arc<W>) -> Self {
        Self { provider }
    }

    /// The caller guarantees the wallet is on `descriptor`'s chain.
    pub async fn submit(
        &self,
        descriptor: &ChainDescriptor,
        from: Address,
        recipient: Address,
        charge: &ChargeAmount,
    ) -> SubmitOutcome {
        let payload = match build_transfer_payload(descriptor, from, recipient, charge) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!(chain = %descriptor.id, %reason, "transfer preparation failed");
                return SubmitOutcome::PreparationFailed { reason };
            }
        };
        match self.provider.send_transaction(&payload).await {
            Ok(tx_hash) => {
                info!(chain = %descriptor.id, %tx_hash, %charge, "transfer submitted");
                SubmitOutcome::Submitted { tx_hash }
            }
            Err(e) => {
                let (cause, reason) = classify_send_error(e);
                warn!(chain = %descriptor.id, ?cause, %reason, "wallet refused transfer");
                SubmitOutcome::Rejected { cause, reason }
            }
        }
    }
}

fn classify_send_error(e: PortError) -> (RejectionCause, String) {
    match e {
        PortError::Rejected(reason) => (RejectionCause::UserRejected, reason),
        PortError::InsufficientFunds(reason) => (RejectionCause::InsufficientFunds, reason),
        other => (RejectionCause::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainId, ChainRegistry};
    use alloy::primitives::address;

    const MERCHANT: Address = address!("00000000000000000000000000000000000000aa");
    const BUYER: Address = address!("00000000000000000000000000000000000000bb");

    #[test]
    fn transfer_calldata_has_selector_and_args() {
        let data = encode_transfer(MERCHANT, U256::from(12_500_000u64));
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[16..36], MERCHANT.as_slice());
        assert_eq!(U256::from_be_slice(&data[36..68]), U256::from(12_500_000u64));
    }

    #[test]
    fn payload_targets_token_contract_with_chain_decimals() {
        let charge = ChargeAmount::new(1250, 2, "USDT");
        let bsc = ChainRegistry.describe(ChainId::BscMainnet);
        let payload = build_transfer_payload(bsc, BUYER, MERCHANT, &charge).expect("payload");
        assert_eq!(
            payload["to"].as_str().map(str::to_lowercase),
            Some(bsc.token_contract.to_string().to_lowercase())
        );
        assert_eq!(payload["chainId"], "0x38");
        assert_eq!(payload["value"], "0x0");

        let data: Bytes = serde_json::from_value(payload["data"].clone()).expect("bytes");
        assert_eq!(
            U256::from_be_slice(&data[36..68]),
            U256::from(12_500_000_000_000_000_000u128)
        );
    }

    #[test]
    fn mismatched_currency_or_zero_amount_is_refused() {
        let eth = ChainRegistry.describe(ChainId::Ethereum);
        assert!(build_transfer_payload(eth, BUYER, MERCHANT, &ChargeAmount::new(1, 2, "EUR")).is_err());
        assert!(build_transfer_payload(eth, BUYER, MERCHANT, &ChargeAmount::new(0, 2, "USDT")).is_err());
        assert!(
            build_transfer_payload(eth, BUYER, Address::ZERO, &ChargeAmount::new(1, 2, "USDT"))
                .is_err()
        );
    }

    #[test]
    fn rejection_causes_map_to_error_kinds() {
        let declined = SubmitOutcome::Rejected {
            cause: RejectionCause::UserRejected,
            reason: "denied".to_owned(),
        };
        assert_eq!(
            declined.into_error().map(|e| e.kind),
            Some(ErrorKind::UserRejected)
        );
        let (cause, _) = classify_send_error(PortError::InsufficientFunds("gas".to_owned()));
        assert_eq!(cause, RejectionCause::InsufficientFunds);
        let (cause, reason) = classify_send_error(PortError::Transport("timeout".to_owned()));
        assert_eq!(cause, RejectionCause::Other);
        assert!(reason.contains("timeout"));
    }
}
