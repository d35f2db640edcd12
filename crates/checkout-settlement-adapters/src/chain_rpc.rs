use alloy::primitives::B256;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use checkout_settlement_core::{ChainDescriptor, ChainRpcPort, PortError, ReceiptStatus};

use crate::CheckoutAdapterConfig;

/// Receipt lookups over plain JSON-RPC (`eth_getTransactionReceipt`).
#[derive(Debug, Clone)]
pub struct JsonRpcChainAdapter {
    url: String,
    client: reqwest::Client,
}

impl JsonRpcChainAdapter {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, PortError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Transport(format!("failed to initialize rpc client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Uses `CHECKOUT_CHAIN_RPC_URL` when configured, else the chain's first public endpoint.
    pub fn for_chain(
        descriptor: &ChainDescriptor,
        config: &CheckoutAdapterConfig,
    ) -> Result<Self, PortError> {
        let url = match (&config.chain_rpc_url, descriptor.rpc_urls.first()) {
            (Some(url), _) => url.clone(),
            (None, Some(url)) => (*url).to_owned(),
            (None, None) => {
                return Err(PortError::Validation(format!(
                    "no rpc endpoint known for {}",
                    descriptor.display_name
                )))
            }
        };
        Self::new(url, config.http_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, PortError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("rpc request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortError::Transport(format!("rpc status {status}")));
        }
        let mut body: Value = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("rpc json decode failed: {e}")))?;
        if let Some(err) = body.get("error") {
            return Err(PortError::Provider {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown rpc error")
                    .to_owned(),
            });
        }
        Ok(body
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainRpcPort for JsonRpcChainAdapter {
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, PortError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            debug!(%tx_hash, "receipt not available yet");
            return Ok(None);
        }
        parse_receipt(&result).map(Some)
    }
}

fn parse_receipt(receipt: &Value) -> Result<ReceiptStatus, PortError> {
    let status = receipt
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| PortError::Validation("receipt missing status".to_owned()))?;
    let success = quantity(status)? == 1;
    let block_number = match receipt.get("blockNumber").and_then(Value::as_str) {
        Some(raw) => Some(quantity(raw)?),
        None => None,
    };
    Ok(ReceiptStatus {
        success,
        block_number,
    })
}

fn quantity(raw: &str) -> Result<u64, PortError> {
    let hex = raw
        .strip_prefix("0x")
        .ok_or_else(|| PortError::Validation(format!("quantity must be 0x-prefixed: {raw}")))?;
    u64::from_str_radix(hex, 16)
        .map_err(|e| PortError::Validation(format!("invalid quantity {raw}: {e}")))
}
