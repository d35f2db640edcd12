use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use tracing::{debug, info, warn};

use crate::chain::ChainDescriptor;
use crate::domain::{ErrorKind, ProviderEvent, SessionError};
use crate::ports::{PortError, WalletProviderPort};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { address: Address },
    Rejected { reason: String },
    NoProviderAvailable { reason: String },
    Failed { reason: String },
}

impl ConnectOutcome {
    pub fn into_error(self) -> Option<SessionError> {
        match self {
            ConnectOutcome::Connected { .. } => None,
            ConnectOutcome::Rejected { reason } => {
                Some(SessionError::new(ErrorKind::UserRejected, reason))
            }
            ConnectOutcome::NoProviderAvailable { reason } => {
                Some(SessionError::new(ErrorKind::NoWalletProvider, reason))
            }
            ConnectOutcome::Failed { reason } => Some(SessionError::new(ErrorKind::Unknown, reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    Rejected { reason: String },
    Unsupported { reason: String },
    Failed { reason: String },
}

impl SwitchOutcome {
    pub fn into_error(self) -> Option<SessionError> {
        match self {
            SwitchOutcome::Switched => None,
            SwitchOutcome::Rejected { reason } => {
                Some(SessionError::new(ErrorKind::UserRejected, reason))
            }
            SwitchOutcome::Unsupported { reason } => {
                Some(SessionError::new(ErrorKind::UnsupportedChain, reason))
            }
            SwitchOutcome::Failed { reason } => {
                Some(SessionError::new(ErrorKind::ChainSwitchFailed, reason))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCheck {
    Matches,
    Mismatch { expected: u64, actual: u64 },
}

/// Session-scoped view of the injected wallet.
#[derive(Debug)]
pub struct WalletGateway<W> {
    provider: Arc<W>,
    attached: Mutex<Option<Address>>,
}

impl<W: WalletProviderPort> WalletGateway<W> {
    pub fn new(provider: Arc<W>) -> Self {
        Self {
            provider,
            attached: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<W> {
        &self.provider
    }

    pub fn address(&self) -> Option<Address> {
        self.attached.lock().ok().and_then(|g| *g)
    }

    pub fn is_connected(&self) -> bool {
        self.address().is_some()
    }

    pub async fn connect(&self) -> ConnectOutcome {
        let accounts = match self.provider.request_accounts().await {
            Ok(accounts) => accounts,
            Err(PortError::NoProvider(reason)) => {
                return ConnectOutcome::NoProviderAvailable { reason }
            }
            Err(PortError::Rejected(reason)) => return ConnectOutcome::Rejected { reason },
            Err(e) => return ConnectOutcome::Failed {
                reason: e.to_string(),
            },
        };
        let Some(address) = accounts.first().copied() else {
            return ConnectOutcome::Failed {
                reason: "wallet returned no accounts".to_owned(),
            };
        };
        self.attach(Some(address));
        info!(%address, "wallet connected");
        ConnectOutcome::Connected { address }
    }

    pub async fn current_chain(&self) -> Result<u64, PortError> {
        self.provider.chain_id().await
    }

    /// Switches the wallet to `descriptor`'s chain, registering the chain first if the wallet
    /// does not know it, then confirms the wallet actually moved.
    pub async fn switch_or_add_chain(&self, descriptor: &ChainDescriptor) -> SwitchOutcome {
        let target = descriptor.chain_id();
        match self.current_chain().await {
            Ok(active) if active == target => return SwitchOutcome::Switched,
            Ok(_) => {}
            Err(e) => debug!(error = %e, "could not read active chain before switching"),
        }

        match self.provider.switch_chain(target).await {
            Ok(()) => {}
            Err(PortError::UnrecognizedChain(_)) => {
                info!(chain = %descriptor.id, "wallet does not know chain; adding it");
                match self.provider.add_chain(&descriptor.add_chain_params()).await {
                    Ok(()) => {}
                    Err(PortError::Rejected(reason)) => return SwitchOutcome::Rejected { reason },
                    Err(e) => {
                        return SwitchOutcome::Unsupported {
                            reason: e.to_string(),
                        }
                    }
                }
                if let Err(e) = self.provider.switch_chain(target).await {
                    return classify_switch_error(e);
                }
            }
            Err(e) => return classify_switch_error(e),
        }

        match self.current_chain().await {
            Ok(active) if active == target => SwitchOutcome::Switched,
            Ok(active) => {
                warn!(expected = target, actual = active, "wallet acknowledged switch but stayed on another chain");
                SwitchOutcome::Failed {
                    reason: format!("wallet is on chain {active:#x} after switching to {target:#x}"),
                }
            }
            Err(e) => SwitchOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Re-reads the active chain immediately before a submission.
    pub async fn ensure_chain(&self, descriptor: &ChainDescriptor) -> Result<ChainCheck, PortError> {
        let actual = self.current_chain().await?;
        let expected = descriptor.chain_id();
        if actual == expected {
            Ok(ChainCheck::Matches)
        } else {
            Ok(ChainCheck::Mismatch { expected, actual })
        }
    }

    /// Drops the local attachment. Provider-level permissions are left to the wallet.
    pub fn disconnect(&self) {
        if let Some(address) = self.attach(None) {
            info!(%address, "wallet detached");
        }
    }

    pub fn drain_events(&self) -> Result<Vec<ProviderEvent>, PortError> {
        self.provider.drain_events()
    }

    pub(crate) fn attach(&self, address: Option<Address>) -> Option<Address> {
        match self.attached.lock() {
            Ok(mut g) => std::mem::replace(&mut *g, address),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), address),
        }
    }
}

fn classify_switch_error(e: PortError) -> SwitchOutcome {
    match e {
        PortError::Rejected(reason) => SwitchOutcome::Rejected { reason },
        PortError::UnrecognizedChain(chain) => SwitchOutcome::Unsupported {
            reason: format!("wallet does not support chain {chain:#x}"),
        },
        PortError::NotImplemented(method) => SwitchOutcome::Unsupported {
            reason: format!("wallet does not implement {method}"),
        },
        other => SwitchOutcome::Failed {
            reason: other.to_string(),
        },
    }
}
