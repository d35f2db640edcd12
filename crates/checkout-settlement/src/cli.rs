use alloy::primitives::Address;
use clap::Parser;
use eyre::{bail, Result, WrapErr};
use rust_decimal::Decimal;
use serde_json::Value;

use checkout_settlement_core::{ChargeAmount, CheckoutContext};

#[derive(Debug, Parser)]
#[command(author, version, about = "Drive one crypto checkout from wallet connection to settlement")]
pub struct Cli {
    /// Payment chain: ethereum, bsc, bsc-testnet, polygon, sepolia, or a numeric chain id
    #[arg(long, default_value = "ethereum")]
    pub chain: String,

    /// Display amount, e.g. 12.50
    #[arg(long)]
    pub amount: Decimal,

    #[arg(long, default_value = "USDT")]
    pub currency: String,

    /// Merchant address receiving the transfer
    #[arg(long)]
    pub recipient: Address,

    #[arg(long)]
    pub agent_id: String,

    #[arg(long)]
    pub user_id: String,

    /// Cart contents as JSON, forwarded to the order backend untouched
    #[arg(long)]
    pub cart: Option<String>,

    #[arg(long)]
    pub session_id: Option<String>,
}

impl Cli {
    pub fn charge(&self) -> Result<ChargeAmount> {
        charge_from_decimal(self.amount, &self.currency)
    }

    pub fn checkout(&self) -> Result<CheckoutContext> {
        let cart = match self.cart {
            Some(ref raw) => serde_json::from_str(raw).wrap_err("--cart is not valid JSON")?,
            None => Value::Null,
        };
        Ok(CheckoutContext {
            agent_id: self.agent_id.clone(),
            user_id: self.user_id.clone(),
            cart,
        })
    }
}

/// `12.50` becomes 1250 minor units at exponent 2; the scale as typed is kept.
pub fn charge_from_decimal(amount: Decimal, currency: &str) -> Result<ChargeAmount> {
    if amount <= Decimal::ZERO {
        bail!("amount must be positive, got {amount}");
    }
    let exponent = u8::try_from(amount.scale()).wrap_err("amount has too many decimal places")?;
    let minor_units =
        u64::try_from(amount.mantissa()).wrap_err_with(|| format!("amount {amount} is too large"))?;
    Ok(ChargeAmount::new(minor_units, exponent, currency.trim().to_ascii_uppercase()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn display_amounts_keep_their_scale() {
        let charge = charge_from_decimal(Decimal::from_str("12.50").expect("decimal"), "usdt")
            .expect("charge");
        assert_eq!(charge, ChargeAmount::new(1250, 2, "USDT"));

        let whole = charge_from_decimal(Decimal::from(3), "USDT").expect("charge");
        assert_eq!(whole, ChargeAmount::new(3, 0, "USDT"));
    }

    #[test]
    fn non_positive_amounts_are_refused() {
        assert!(charge_from_decimal(Decimal::ZERO, "USDT").is_err());
        assert!(charge_from_decimal(Decimal::from_str("-1.5").expect("decimal"), "USDT").is_err());
    }

    #[test]
    fn parses_checkout_flags() {
        let cli = Cli::try_parse_from([
            "checkout-settlement",
            "--chain",
            "bsc",
            "--amount",
            "9.99",
            "--recipient",
            "0x000000000000000000000000000000000000BEEF",
            "--agent-id",
            "agent-7",
            "--user-id",
            "user-42",
            "--cart",
            r#"{"items":[{"sku":"plan-pro"}]}"#,
        ])
        .expect("valid flags");
        assert_eq!(cli.chain, "bsc");
        assert_eq!(cli.charge().expect("charge"), ChargeAmount::new(999, 2, "USDT"));
        let checkout = cli.checkout().expect("checkout");
        assert_eq!(checkout.cart["items"][0]["sku"], "plan-pro");
    }
}
