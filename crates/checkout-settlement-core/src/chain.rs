//! Supported payment chains and their token deployments.
//!
//! Every chain the checkout accepts is a [`ChainId`] variant, and every variant resolves to
//! exactly one static [`ChainDescriptor`]. Raw ids coming from a wallet or a caller go through
//! [`ChainRegistry::lookup`]; anything outside the table is a configuration error.
//!
//! The same logical token does not share a precision across chains (USDT is 6 decimals on
//! Ethereum and Polygon, 18 on BNB Smart Chain), so the transfer amount is always derived from
//! the descriptor, never from a global constant.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use alloy::primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ChargeAmount;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("chain not supported: {0}")]
    NotSupported(String),
    #[error("charge of {minor_units} (exponent {exponent}) is not representable with {decimals} token decimals")]
    AmountNotRepresentable {
        minor_units: u64,
        exponent: u8,
        decimals: u8,
    },
}

/// Chains accepted for crypto checkout.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainId {
    /// Ethereum mainnet (chain ID 1).
    #[serde(rename = "ethereum")]
    Ethereum,
    /// BNB Smart Chain mainnet (chain ID 56).
    #[serde(rename = "bsc")]
    BscMainnet,
    /// BNB Smart Chain testnet (chain ID 97).
    #[serde(rename = "bsc-testnet")]
    BscTestnet,
    /// Polygon PoS mainnet (chain ID 137).
    #[serde(rename = "polygon")]
    Polygon,
    /// Sepolia testnet (chain ID 11155111).
    #[serde(rename = "sepolia")]
    Sepolia,
}

impl ChainId {
    pub fn variants() -> &'static [ChainId] {
        &[
            ChainId::Ethereum,
            ChainId::BscMainnet,
            ChainId::BscTestnet,
            ChainId::Polygon,
            ChainId::Sepolia,
        ]
    }

    /// EIP-155 chain id.
    pub fn as_u64(&self) -> u64 {
        match self {
            ChainId::Ethereum => 1,
            ChainId::BscMainnet => 56,
            ChainId::BscTestnet => 97,
            ChainId::Polygon => 137,
            ChainId::Sepolia => 11_155_111,
        }
    }

    pub fn from_u64(raw: u64) -> Option<ChainId> {
        Self::variants()
            .iter()
            .copied()
            .find(|chain| chain.as_u64() == raw)
    }

    /// Hex form used by EIP-1193 wallets, e.g. `0x38`.
    pub fn hex_id(&self) -> String {
        format!("{:#x}", self.as_u64())
    }

    pub fn slug(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::BscMainnet => "bsc",
            ChainId::BscTestnet => "bsc-testnet",
            ChainId::Polygon => "polygon",
            ChainId::Sepolia => "sepolia",
        }
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ChainId {
    type Err = RegistryError;

    /// Accepts the hex id (`0x38`), the decimal id (`56`) or the slug (`bsc`).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let numeric = if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16).ok()
        } else {
            trimmed.parse::<u64>().ok()
        };
        if let Some(id) = numeric {
            return ChainId::from_u64(id).ok_or_else(|| RegistryError::NotSupported(raw.to_owned()));
        }
        ChainId::variants()
            .iter()
            .copied()
            .find(|chain| chain.slug().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| RegistryError::NotSupported(raw.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeCurrency {
    pub name: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

/// Static metadata for one chain/token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainDescriptor {
    pub id: ChainId,
    pub display_name: &'static str,
    pub token_symbol: &'static str,
    pub token_contract: Address,
    pub token_decimals: u8,
    pub native_currency: NativeCurrency,
    pub rpc_urls: &'static [&'static str],
    pub block_explorer_urls: &'static [&'static str],
}

impl ChainDescriptor {
    pub fn chain_id(&self) -> u64 {
        self.id.as_u64()
    }

    /// Converts a fixed charge into the token's base units on this chain.
    ///
    /// Scaling down (token precision below the charge's exponent) must divide exactly; a charge
    /// that would lose value is refused rather than rounded.
    pub fn token_units(&self, charge: &ChargeAmount) -> Result<U256, RegistryError> {
        let minor = U256::from(charge.minor_units);
        let ten = U256::from(10u8);
        if self.token_decimals >= charge.exponent {
            let scale = ten.pow(U256::from(self.token_decimals - charge.exponent));
            return Ok(minor * scale);
        }
        let divisor = ten.pow(U256::from(charge.exponent - self.token_decimals));
        if minor % divisor != U256::ZERO {
            return Err(RegistryError::AmountNotRepresentable {
                minor_units: charge.minor_units,
                exponent: charge.exponent,
                decimals: self.token_decimals,
            });
        }
        Ok(minor / divisor)
    }

    /// `wallet_addEthereumChain` parameters (EIP-3085).
    pub fn add_chain_params(&self) -> serde_json::Value {
        serde_json::json!({
            "chainId": self.id.hex_id(),
            "chainName": self.display_name,
            "nativeCurrency": {
                "name": self.native_currency.name,
                "symbol": self.native_currency.symbol,
                "decimals": self.native_currency.decimals,
            },
            "rpcUrls": self.rpc_urls,
            "blockExplorerUrls": self.block_explorer_urls,
        })
    }
}

static DESCRIPTORS: [ChainDescriptor; 5] = [
    ChainDescriptor {
        id: ChainId::Ethereum,
        display_name: "Ethereum Mainnet",
        token_symbol: "USDT",
        token_contract: address!("dAC17F958D2ee523a2206206994597C13D831ec7"),
        token_decimals: 6,
        native_currency: NativeCurrency {
            name: "Ether",
            symbol: "ETH",
            decimals: 18,
        },
        rpc_urls: &["https://eth.llamarpc.com"],
        block_explorer_urls: &["https://etherscan.io"],
    },
    ChainDescriptor {
        id: ChainId::BscMainnet,
        display_name: "BNB Smart Chain",
        token_symbol: "USDT",
        token_contract: address!("55d398326f99059fF775485246999027B3197955"),
        token_decimals: 18,
        native_currency: NativeCurrency {
            name: "BNB",
            symbol: "BNB",
            decimals: 18,
        },
        rpc_urls: &["https://bsc-dataseed.binance.org"],
        block_explorer_urls: &["https://bscscan.com"],
    },
    ChainDescriptor {
        id: ChainId::BscTestnet,
        display_name: "BNB Smart Chain Testnet",
        token_symbol: "USDT",
        token_contract: address!("337610d27c682E347C9cD60BD4b3b107C9d34dDd"),
        token_decimals: 18,
        native_currency: NativeCurrency {
            name: "Test BNB",
            symbol: "tBNB",
            decimals: 18,
        },
        rpc_urls: &["https://data-seed-prebsc-1-s1.binance.org:8545"],
        block_explorer_urls: &["https://testnet.bscscan.com"],
    },
    ChainDescriptor {
        id: ChainId::Polygon,
        display_name: "Polygon Mainnet",
        token_symbol: "USDT",
        token_contract: address!("c2132D05D31c914a87C6611C10748AEb04B58e8F"),
        token_decimals: 6,
        native_currency: NativeCurrency {
            name: "POL",
            symbol: "POL",
            decimals: 18,
        },
        rpc_urls: &["https://polygon-rpc.com"],
        block_explorer_urls: &["https://polygonscan.com"],
    },
    ChainDescriptor {
        id: ChainId::Sepolia,
        display_name: "Sepolia",
        token_symbol: "USDT",
        token_contract: address!("aA8E23Fb1079EA71e0a56F48a2aA51851D8433D0"),
        token_decimals: 6,
        native_currency: NativeCurrency {
            name: "Sepolia Ether",
            symbol: "ETH",
            decimals: 18,
        },
        rpc_urls: &["https://rpc.sepolia.org"],
        block_explorer_urls: &["https://sepolia.etherscan.io"],
    },
];

/// Lookup over the fixed descriptor table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainRegistry;

impl ChainRegistry {
    pub fn describe(&self, chain: ChainId) -> &'static ChainDescriptor {
        // One entry per variant, in declaration order.
        &DESCRIPTORS[chain as usize]
    }

    pub fn lookup(&self, raw_chain_id: u64) -> Result<&'static ChainDescriptor, RegistryError> {
        ChainId::from_u64(raw_chain_id)
            .map(|chain| self.describe(chain))
            .ok_or_else(|| RegistryError::NotSupported(format!("{raw_chain_id:#x}")))
    }

    pub fn parse(&self, raw: &str) -> Result<&'static ChainDescriptor, RegistryError> {
        raw.parse::<ChainId>().map(|chain| self.describe(chain))
    }

    pub fn supported(&self) -> impl Iterator<Item = &'static ChainDescriptor> {
        DESCRIPTORS.iter()
    }
}
