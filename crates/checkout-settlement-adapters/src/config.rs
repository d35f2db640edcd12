use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use checkout_settlement_core::{CoordinatorConfig, PollPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeProfile {
    #[default]
    Development,
    Production,
}

impl FromStr for RuntimeProfile {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Ok(RuntimeProfile::Development),
            "prod" | "production" => Ok(RuntimeProfile::Production),
            other => Err(format!("unknown runtime profile: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutAdapterConfig {
    pub runtime_profile: RuntimeProfile,
    pub eip1193_proxy_url: Option<String>,
    /// Replaces the chain descriptor's public RPC endpoint when set.
    pub chain_rpc_url: Option<String>,
    pub order_backend_url: Option<String>,
    pub order_backend_token: Option<String>,
    pub http_timeout_ms: u64,
    pub confirmation_poll_interval_ms: u64,
    pub confirmation_max_wait_ms: Option<u64>,
    pub settlement_poll_interval_ms: u64,
    pub settlement_max_wait_ms: Option<u64>,
    pub poll_backoff_factor: f64,
}

impl Default for CheckoutAdapterConfig {
    fn default() -> Self {
        Self {
            runtime_profile: RuntimeProfile::Development,
            eip1193_proxy_url: None,
            chain_rpc_url: None,
            order_backend_url: None,
            order_backend_token: None,
            http_timeout_ms: 15_000,
            confirmation_poll_interval_ms: 2_000,
            confirmation_max_wait_ms: Some(10 * 60 * 1000),
            settlement_poll_interval_ms: 3_000,
            settlement_max_wait_ms: Some(15 * 60 * 1000),
            poll_backoff_factor: 1.5,
        }
    }
}

impl CheckoutAdapterConfig {
    /// Reads `CHECKOUT_*` variables. Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            runtime_profile: parsed(&get, "CHECKOUT_RUNTIME_PROFILE")
                .unwrap_or(defaults.runtime_profile),
            eip1193_proxy_url: get("CHECKOUT_EIP1193_PROXY_URL"),
            chain_rpc_url: get("CHECKOUT_CHAIN_RPC_URL"),
            order_backend_url: get("CHECKOUT_ORDER_BACKEND_URL")
                .map(|url| url.trim_end_matches('/').to_owned()),
            order_backend_token: get("CHECKOUT_ORDER_BACKEND_TOKEN"),
            http_timeout_ms: parsed(&get, "CHECKOUT_HTTP_TIMEOUT_MS")
                .unwrap_or(defaults.http_timeout_ms),
            confirmation_poll_interval_ms: parsed(&get, "CHECKOUT_CONFIRMATION_POLL_MS")
                .unwrap_or(defaults.confirmation_poll_interval_ms),
            confirmation_max_wait_ms: max_wait(&get, "CHECKOUT_CONFIRMATION_MAX_WAIT_MS")
                .unwrap_or(defaults.confirmation_max_wait_ms),
            settlement_poll_interval_ms: parsed(&get, "CHECKOUT_SETTLEMENT_POLL_MS")
                .unwrap_or(defaults.settlement_poll_interval_ms),
            settlement_max_wait_ms: max_wait(&get, "CHECKOUT_SETTLEMENT_MAX_WAIT_MS")
                .unwrap_or(defaults.settlement_max_wait_ms),
            poll_backoff_factor: backoff(&get, "CHECKOUT_POLL_BACKOFF")
                .unwrap_or(defaults.poll_backoff_factor),
        }
    }

    /// Production never falls back to the deterministic wallet or the in-memory backend.
    pub fn strict_runtime_required(&self) -> bool {
        self.runtime_profile == RuntimeProfile::Production
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn confirmation_policy(&self) -> PollPolicy {
        self.policy(
            self.confirmation_poll_interval_ms,
            self.confirmation_max_wait_ms,
            PollPolicy::confirmation_default().max_interval,
        )
    }

    pub fn settlement_policy(&self) -> PollPolicy {
        self.policy(
            self.settlement_poll_interval_ms,
            self.settlement_max_wait_ms,
            PollPolicy::settlement_default().max_interval,
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            confirmation: self.confirmation_policy(),
            settlement: self.settlement_policy(),
        }
    }

    fn policy(&self, interval_ms: u64, max_wait_ms: Option<u64>, cap: Duration) -> PollPolicy {
        let interval = Duration::from_millis(interval_ms.max(1));
        PollPolicy {
            interval,
            backoff_factor: if self.poll_backoff_factor.is_finite() {
                self.poll_backoff_factor.max(1.0)
            } else {
                1.0
            },
            max_interval: cap.max(interval),
            max_wait: max_wait_ms.map(Duration::from_millis),
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

/// Factors must be finite and at least `1.0`.
fn backoff(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f64> {
    let factor = parsed::<f64>(get, key)?;
    if factor.is_finite() && factor >= 1.0 {
        Some(factor)
    } else {
        warn!(key, factor, "ignoring out-of-range backoff factor");
        None
    }
}

/// `0` disables the limit.
fn max_wait(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Option<u64>> {
    parsed::<u64>(get, key).map(|ms| (ms > 0).then_some(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_checkout_variables() {
        let cfg = CheckoutAdapterConfig::from_lookup(lookup(&[
            ("CHECKOUT_RUNTIME_PROFILE", "production"),
            ("CHECKOUT_ORDER_BACKEND_URL", "https://api.example.test/v1/"),
            ("CHECKOUT_ORDER_BACKEND_TOKEN", " secret "),
            ("CHECKOUT_CONFIRMATION_POLL_MS", "500"),
            ("CHECKOUT_SETTLEMENT_MAX_WAIT_MS", "0"),
        ]));
        assert!(cfg.strict_runtime_required());
        assert_eq!(
            cfg.order_backend_url.as_deref(),
            Some("https://api.example.test/v1")
        );
        assert_eq!(cfg.order_backend_token.as_deref(), Some("secret"));
        assert_eq!(
            cfg.confirmation_policy().interval,
            Duration::from_millis(500)
        );
        assert_eq!(cfg.settlement_policy().max_wait, None);
        assert_eq!(
            cfg.confirmation_policy().max_wait,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let cfg = CheckoutAdapterConfig::from_lookup(lookup(&[
            ("CHECKOUT_RUNTIME_PROFILE", "staging"),
            ("CHECKOUT_HTTP_TIMEOUT_MS", "soon"),
            ("CHECKOUT_EIP1193_PROXY_URL", "   "),
        ]));
        assert_eq!(cfg, CheckoutAdapterConfig::default());
        assert!(!cfg.strict_runtime_required());
    }

    #[test]
    fn backoff_factor_must_be_finite() {
        for raw in ["inf", "NaN", "0.5"] {
            let cfg =
                CheckoutAdapterConfig::from_lookup(lookup(&[("CHECKOUT_POLL_BACKOFF", raw)]));
            assert_eq!(cfg.poll_backoff_factor, 1.5, "{raw}");
        }

        let cfg = CheckoutAdapterConfig {
            poll_backoff_factor: f64::INFINITY,
            ..CheckoutAdapterConfig::default()
        };
        assert_eq!(cfg.confirmation_policy().backoff_factor, 1.0);
        assert_eq!(cfg.settlement_policy().backoff_factor, 1.0);
    }
}
