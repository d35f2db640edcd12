use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use checkout_settlement_core::{
    OrderBackendPort, OrderId, OrderRequest, PortError, SettlementStatus,
};

use crate::CheckoutAdapterConfig;

/// Order creation and settlement status for the checkout backend.
///
/// HTTP mode talks to `POST {base}/orders` and `GET {base}/orders/{id}`. In-memory mode keeps
/// orders locally and replays a scripted status sequence per order.
#[derive(Debug, Clone)]
pub struct OrderBackendAdapter {
    mode: BackendMode,
    state: Arc<Mutex<InMemoryState>>,
}

#[derive(Debug, Clone)]
enum BackendMode {
    Disabled(String),
    InMemory,
    Http(HttpRuntime),
}

#[derive(Debug, Clone)]
struct HttpRuntime {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
struct InMemoryState {
    script: Vec<SettlementStatus>,
    orders: BTreeMap<String, StoredOrder>,
    next_id: u64,
    fail_next_create: Option<PortError>,
}

#[derive(Debug, Clone)]
struct StoredOrder {
    request: OrderRequest,
    remaining: VecDeque<SettlementStatus>,
    last: SettlementStatus,
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self {
            script: vec![SettlementStatus::Pending, SettlementStatus::Succeeded],
            orders: BTreeMap::new(),
            next_id: 0,
            fail_next_create: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl WireStatus {
    fn into_status(self) -> SettlementStatus {
        match self.status.to_ascii_lowercase().as_str() {
            "succeeded" | "settled" | "completed" => SettlementStatus::Succeeded,
            "failed" | "cancelled" | "rejected" => SettlementStatus::Failed {
                reason: self.reason,
            },
            _ => SettlementStatus::Pending,
        }
    }
}

impl Default for OrderBackendAdapter {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl OrderBackendAdapter {
    pub fn in_memory() -> Self {
        Self {
            mode: BackendMode::InMemory,
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    /// In-memory backend whose orders report `script` in order, then repeat its last entry.
    pub fn scripted(script: Vec<SettlementStatus>) -> Self {
        let adapter = Self::in_memory();
        if let Ok(mut g) = adapter.state.lock() {
            if !script.is_empty() {
                g.script = script;
            }
        }
        adapter
    }

    pub fn from_env() -> Self {
        Self::with_config(&CheckoutAdapterConfig::from_env())
    }

    pub fn with_config(config: &CheckoutAdapterConfig) -> Self {
        let mode = match config.order_backend_url {
            Some(ref base_url) => match reqwest::Client::builder()
                .timeout(config.http_timeout())
                .build()
            {
                Ok(client) => BackendMode::Http(HttpRuntime {
                    base_url: base_url.trim_end_matches('/').to_owned(),
                    token: config.order_backend_token.clone(),
                    client,
                }),
                Err(e) if config.strict_runtime_required() => BackendMode::Disabled(format!(
                    "failed to initialize order backend client in production profile: {e}"
                )),
                Err(_) => BackendMode::InMemory,
            },
            None if config.strict_runtime_required() => BackendMode::Disabled(
                "order backend URL not configured in production runtime profile".to_owned(),
            ),
            None => BackendMode::InMemory,
        };
        Self {
            mode,
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            BackendMode::Disabled(_) => "disabled",
            BackendMode::InMemory => "in-memory",
            BackendMode::Http(_) => "http",
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, InMemoryState>, PortError> {
        self.state
            .lock()
            .map_err(|e| PortError::Transport(format!("order backend lock poisoned: {e}")))
    }

    pub fn debug_fail_next_create(&self, error: PortError) -> Result<(), PortError> {
        self.state()?.fail_next_create = Some(error);
        Ok(())
    }

    /// Orders accepted by the in-memory backend, by id.
    pub fn orders(&self) -> Result<Vec<(OrderId, OrderRequest)>, PortError> {
        Ok(self
            .state()?
            .orders
            .iter()
            .map(|(id, order)| (OrderId(id.clone()), order.request.clone()))
            .collect())
    }

    fn request(&self, http: &HttpRuntime, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match http.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn http_create(
        &self,
        http: &HttpRuntime,
        request: &OrderRequest,
    ) -> Result<OrderId, PortError> {
        let url = format!("{}/orders", http.base_url);
        let response = self
            .request(http, http.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("create order request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortError::Transport(format!(
                "create order status {status}: {body}"
            )));
        }
        let created: CreatedOrder = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("create order json decode failed: {e}")))?;
        if created.order_id.is_empty() {
            return Err(PortError::Validation("backend returned empty order id".to_owned()));
        }
        Ok(OrderId(created.order_id))
    }

    async fn http_status(
        &self,
        http: &HttpRuntime,
        order_id: &OrderId,
    ) -> Result<SettlementStatus, PortError> {
        let url = format!("{}/orders/{}", http.base_url, order_id.0);
        let response = self
            .request(http, http.client.get(&url))
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("order status request failed: {e}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PortError::NotFound(format!("order {}", order_id.0)));
        }
        if !status.is_success() {
            return Err(PortError::Transport(format!("order status {status}")));
        }
        let wire: WireStatus = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("order status json decode failed: {e}")))?;
        Ok(wire.into_status())
    }
}

#[async_trait]
impl OrderBackendPort for OrderBackendAdapter {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderId, PortError> {
        match &self.mode {
            BackendMode::Disabled(reason) => Err(PortError::Policy(reason.clone())),
            BackendMode::Http(http) => self.http_create(http, request).await,
            BackendMode::InMemory => {
                let mut g = self.state()?;
                if let Some(err) = g.fail_next_create.take() {
                    return Err(err);
                }
                g.next_id += 1;
                let id = format!("ord_{}", g.next_id);
                let mut remaining: VecDeque<SettlementStatus> = g.script.iter().cloned().collect();
                let last = remaining.pop_back().unwrap_or(SettlementStatus::Pending);
                g.orders.insert(
                    id.clone(),
                    StoredOrder {
                        request: request.clone(),
                        remaining,
                        last,
                    },
                );
                debug!(order_id = %id, tx_hash = %request.tx_hash, "in-memory order created");
                Ok(OrderId(id))
            }
        }
    }

    async fn order_status(&self, order_id: &OrderId) -> Result<SettlementStatus, PortError> {
        match &self.mode {
            BackendMode::Disabled(reason) => Err(PortError::Policy(reason.clone())),
            BackendMode::Http(http) => self.http_status(http, order_id).await,
            BackendMode::InMemory => {
                let mut g = self.state()?;
                let order = g
                    .orders
                    .get_mut(&order_id.0)
                    .ok_or_else(|| PortError::NotFound(format!("order {}", order_id.0)))?;
                Ok(order
                    .remaining
                    .pop_front()
                    .unwrap_or_else(|| order.last.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_statuses_map_to_settlement_outcomes() {
        let parse = |status: &str, reason: Option<&str>| {
            WireStatus {
                status: status.to_owned(),
                reason: reason.map(str::to_owned),
            }
            .into_status()
        };
        assert_eq!(parse("SETTLED", None), SettlementStatus::Succeeded);
        assert_eq!(parse("completed", None), SettlementStatus::Succeeded);
        assert_eq!(
            parse("rejected", Some("amount mismatch")),
            SettlementStatus::Failed {
                reason: Some("amount mismatch".to_owned())
            }
        );
        assert_eq!(parse("processing", None), SettlementStatus::Pending);
    }
}
