use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{address, keccak256, Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use checkout_settlement_core::{PortError, ProviderEvent, WalletChange, WalletProviderPort};

use crate::CheckoutAdapterConfig;

/// EIP-1193 user-rejected request.
pub const USER_REJECTED: i64 = 4001;
/// EIP-1193 unauthorized account.
pub const UNAUTHORIZED: i64 = 4100;
/// `wallet_switchEthereumChain` for a chain the wallet has not been told about.
pub const UNRECOGNIZED_CHAIN: i64 = 4902;

/// Maps a provider `{code, message}` error to a typed [`PortError`].
///
/// This is the only place provider message text is inspected. `requested_chain` is the chain a
/// switch request targeted, if any.
pub fn classify_provider_error(code: i64, message: &str, requested_chain: Option<u64>) -> PortError {
    match (code, requested_chain) {
        (USER_REJECTED, _) => PortError::Rejected(message.to_owned()),
        (UNRECOGNIZED_CHAIN, Some(chain_id)) => PortError::UnrecognizedChain(chain_id),
        _ if message.to_ascii_lowercase().contains("insufficient funds") => {
            PortError::InsufficientFunds(message.to_owned())
        }
        _ => PortError::Provider {
            code,
            message: message.to_owned(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Eip1193Adapter {
    mode: ProviderMode,
    state: Arc<Mutex<ProviderState>>,
}

#[derive(Debug, Clone)]
enum ProviderMode {
    Disabled(String),
    Deterministic,
    Proxy(ProxyRuntime),
}

#[derive(Debug, Clone)]
struct ProxyRuntime {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
struct ProviderState {
    accounts: Vec<Address>,
    chain_id: u64,
    known_chains: BTreeSet<u64>,
    event_seq: u64,
    events: Vec<ProviderEvent>,
    sent: u64,
    reject_next: bool,
    insufficient_funds_next: bool,
    ignore_switch: bool,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            accounts: vec![address!("1000000000000000000000000000000000000001")],
            chain_id: 1,
            known_chains: [1u64, 56, 137, 11_155_111].into_iter().collect(),
            event_seq: 0,
            events: Vec::new(),
            sent: 0,
            reject_next: false,
            insufficient_funds_next: false,
            ignore_switch: false,
        }
    }
}

impl ProviderState {
    fn record(&mut self, change: WalletChange) {
        self.event_seq = self.event_seq.saturating_add(1);
        let sequence = self.event_seq;
        self.events.push(ProviderEvent { sequence, change });
    }

    fn take_rejection(&mut self, message: &str) -> Result<(), PortError> {
        if std::mem::take(&mut self.reject_next) {
            return Err(classify_provider_error(USER_REJECTED, message, None));
        }
        Ok(())
    }
}

impl Default for Eip1193Adapter {
    fn default() -> Self {
        Self::with_config(&CheckoutAdapterConfig::default())
    }
}

impl Eip1193Adapter {
    pub fn from_env() -> Self {
        Self::with_config(&CheckoutAdapterConfig::from_env())
    }

    pub fn with_config(config: &CheckoutAdapterConfig) -> Self {
        let mode = if let Some(ref base_url) = config.eip1193_proxy_url {
            match reqwest::Client::builder()
                .timeout(config.http_timeout())
                .build()
            {
                Ok(client) => ProviderMode::Proxy(ProxyRuntime {
                    base_url: base_url.clone(),
                    client,
                }),
                Err(e) => {
                    if config.strict_runtime_required() {
                        ProviderMode::Disabled(format!(
                            "failed to initialize EIP-1193 proxy client in production profile: {e}"
                        ))
                    } else {
                        ProviderMode::Deterministic
                    }
                }
            }
        } else if config.strict_runtime_required() {
            ProviderMode::Disabled(
                "EIP-1193 proxy URL not configured in production runtime profile".to_owned(),
            )
        } else {
            ProviderMode::Deterministic
        };

        Self {
            mode,
            state: Arc::new(Mutex::new(ProviderState::default())),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            ProviderMode::Disabled(_) => "disabled",
            ProviderMode::Deterministic => "deterministic",
            ProviderMode::Proxy(_) => "proxy",
        }
    }

    fn check_mode(&self) -> Result<(), PortError> {
        if let ProviderMode::Disabled(reason) = &self.mode {
            return Err(PortError::NoProvider(reason.clone()));
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, ProviderState>, PortError> {
        self.state
            .lock()
            .map_err(|e| PortError::Transport(format!("provider lock poisoned: {e}")))
    }

    pub fn debug_inject_accounts_changed(&self, accounts: Vec<Address>) -> Result<(), PortError> {
        let mut g = self.state()?;
        g.accounts = accounts.clone();
        g.record(WalletChange::AccountsChanged(accounts));
        Ok(())
    }

    pub fn debug_inject_chain_changed(&self, chain_id: u64) -> Result<(), PortError> {
        let mut g = self.state()?;
        g.chain_id = chain_id;
        g.record(WalletChange::ChainChanged(chain_id));
        Ok(())
    }

    /// The next deterministic request fails as if the user pressed "reject".
    pub fn debug_reject_next_request(&self) -> Result<(), PortError> {
        self.state()?.reject_next = true;
        Ok(())
    }

    pub fn debug_fail_next_send_with_insufficient_funds(&self) -> Result<(), PortError> {
        self.state()?.insufficient_funds_next = true;
        Ok(())
    }

    /// Makes the deterministic wallet answer 4902 for `chain_id` until it is added.
    pub fn debug_forget_chain(&self, chain_id: u64) -> Result<(), PortError> {
        self.state()?.known_chains.remove(&chain_id);
        Ok(())
    }

    /// Switch requests succeed without moving the wallet.
    pub fn debug_ignore_switch_requests(&self) -> Result<(), PortError> {
        self.state()?.ignore_switch = true;
        Ok(())
    }

    async fn proxy_call(
        &self,
        method: &str,
        params: Value,
        requested_chain: Option<u64>,
    ) -> Result<Value, PortError> {
        let proxy = match &self.mode {
            ProviderMode::Proxy(proxy) => proxy,
            ProviderMode::Disabled(reason) => return Err(PortError::NoProvider(reason.clone())),
            ProviderMode::Deterministic => {
                return Err(PortError::NotImplemented(
                    "eip1193 proxy runtime not enabled",
                ))
            }
        };

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!(method, "eip1193 proxy request");
        let response = proxy
            .client
            .post(&proxy.base_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("eip1193 proxy request failed: {e}")))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("eip1193 proxy json decode failed: {e}")))?;
        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            return Err(classify_provider_error(code, message, requested_chain));
        }
        if !status.is_success() {
            return Err(PortError::Transport(format!(
                "eip1193 proxy status {status}: {body}"
            )));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| PortError::Transport("eip1193 proxy missing result".to_owned()))
    }
}

#[async_trait]
impl WalletProviderPort for Eip1193Adapter {
    async fn request_accounts(&self) -> Result<Vec<Address>, PortError> {
        self.check_mode()?;

        if matches!(self.mode, ProviderMode::Proxy(_)) {
            let result = self
                .proxy_call("eth_requestAccounts", json!([]), None)
                .await?;
            let accounts: Vec<Address> = serde_json::from_value(result)
                .map_err(|e| PortError::Validation(format!("invalid account list: {e}")))?;
            let mut g = self.state()?;
            if g.accounts != accounts {
                g.accounts = accounts.clone();
                g.record(WalletChange::AccountsChanged(accounts.clone()));
            }
            return Ok(accounts);
        }

        let mut g = self.state()?;
        g.take_rejection("User rejected the request.")?;
        Ok(g.accounts.clone())
    }

    async fn chain_id(&self) -> Result<u64, PortError> {
        self.check_mode()?;

        if matches!(self.mode, ProviderMode::Proxy(_)) {
            let result = self.proxy_call("eth_chainId", json!([]), None).await?;
            let chain_id = json_chain_id_to_u64(&result)?;
            let mut g = self.state()?;
            if g.chain_id != chain_id {
                g.chain_id = chain_id;
                g.record(WalletChange::ChainChanged(chain_id));
            }
            return Ok(chain_id);
        }

        Ok(self.state()?.chain_id)
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), PortError> {
        self.check_mode()?;

        if matches!(self.mode, ProviderMode::Proxy(_)) {
            self.proxy_call(
                "wallet_switchEthereumChain",
                json!([{ "chainId": format!("{chain_id:#x}") }]),
                Some(chain_id),
            )
            .await?;
            return Ok(());
        }

        let mut g = self.state()?;
        g.take_rejection("User rejected the request.")?;
        if !g.known_chains.contains(&chain_id) {
            return Err(classify_provider_error(
                UNRECOGNIZED_CHAIN,
                &format!("Unrecognized chain ID \"{chain_id:#x}\"."),
                Some(chain_id),
            ));
        }
        if !g.ignore_switch && g.chain_id != chain_id {
            g.chain_id = chain_id;
            g.record(WalletChange::ChainChanged(chain_id));
        }
        Ok(())
    }

    async fn add_chain(&self, params: &Value) -> Result<(), PortError> {
        self.check_mode()?;

        if matches!(self.mode, ProviderMode::Proxy(_)) {
            self.proxy_call("wallet_addEthereumChain", json!([params]), None)
                .await?;
            return Ok(());
        }

        let chain_id = params
            .get("chainId")
            .ok_or_else(|| PortError::Validation("chainId missing from add-chain params".to_owned()))
            .and_then(json_chain_id_to_u64)?;
        let mut g = self.state()?;
        g.take_rejection("User rejected the request.")?;
        g.known_chains.insert(chain_id);
        Ok(())
    }

    async fn send_transaction(&self, tx_payload: &Value) -> Result<B256, PortError> {
        self.check_mode()?;

        if matches!(self.mode, ProviderMode::Proxy(_)) {
            let result = self
                .proxy_call("eth_sendTransaction", json!([tx_payload]), None)
                .await?;
            let hash = result.as_str().ok_or_else(|| {
                PortError::Transport("eth_sendTransaction must return hash".to_owned())
            })?;
            return hash
                .parse()
                .map_err(|e| PortError::Validation(format!("invalid tx hash: {e}")));
        }

        let mut g = self.state()?;
        g.take_rejection("User denied transaction signature.")?;
        if std::mem::take(&mut g.insufficient_funds_next) {
            return Err(classify_provider_error(
                -32000,
                "insufficient funds for gas * price + value",
                None,
            ));
        }
        let from: Option<Address> = tx_payload
            .get("from")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        if from.map_or(true, |from| !g.accounts.contains(&from)) {
            return Err(classify_provider_error(
                UNAUTHORIZED,
                "The requested account has not been authorized by the user.",
                None,
            ));
        }
        g.sent = g.sent.saturating_add(1);
        let mut seed = serde_json::to_vec(tx_payload)
            .map_err(|e| PortError::Validation(format!("tx payload serialization failed: {e}")))?;
        seed.extend_from_slice(&g.sent.to_be_bytes());
        Ok(keccak256(seed))
    }

    fn drain_events(&self) -> Result<Vec<ProviderEvent>, PortError> {
        self.check_mode()?;
        Ok(std::mem::take(&mut self.state()?.events))
    }
}

fn json_chain_id_to_u64(value: &Value) -> Result<u64, PortError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let s = value
        .as_str()
        .ok_or_else(|| PortError::Validation("chain id must be string or number".to_owned()))?;
    parse_chain_id_str(s)
}

fn parse_chain_id_str(raw: &str) -> Result<u64, PortError> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| PortError::Validation(format!("invalid hex chain id: {e}")))
    } else {
        raw.parse()
            .map_err(|e| PortError::Validation(format!("invalid chain id: {e}")))
    }
}
