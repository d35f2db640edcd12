//! checkout-settlement: drives one crypto checkout session against the configured wallet bridge,
//! chain RPC and order backend.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, Result};
use tracing::{info, warn};

use checkout_settlement_adapters::{
    CheckoutAdapterConfig, Eip1193Adapter, JsonRpcChainAdapter, OrderBackendAdapter,
    SystemClockAdapter,
};
use checkout_settlement_core::{
    ChainRegistry, ChainRpcPort, ClockPort, OrderBackendPort, PaymentSession,
    PaymentSessionCoordinator, SessionParams, SessionState, WalletProviderPort,
};

mod cli;

/// How often wallet account/chain changes are pulled while waiting.
const WALLET_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = cli::Cli::parse();
    let config = CheckoutAdapterConfig::from_env();
    let descriptor = ChainRegistry.parse(&cli.chain)?;

    let wallet = Arc::new(Eip1193Adapter::with_config(&config));
    let rpc = Arc::new(JsonRpcChainAdapter::for_chain(descriptor, &config)?);
    let backend = Arc::new(OrderBackendAdapter::with_config(&config));
    info!(
        chain = descriptor.display_name,
        wallet = wallet.mode_name(),
        backend = backend.mode_name(),
        rpc = rpc.url(),
        "starting checkout"
    );

    let mut params = SessionParams::new(cli.checkout()?, cli.charge()?, cli.recipient);
    if let Some(ref id) = cli.session_id {
        params = params.with_session_id(id.clone());
    }
    let coordinator = PaymentSessionCoordinator::new(
        wallet,
        rpc,
        backend,
        Arc::new(SystemClockAdapter),
        params,
        config.coordinator_config(),
    )?;
    coordinator.on_settled(|session| {
        info!(session_id = %session.id, "payment settled");
    })?;

    let mut state = coordinator.connect().await?;
    if !state.is_terminal() {
        state = coordinator.select_chain(descriptor.id).await?;
    }
    if !state.is_terminal() {
        state = coordinator.submit().await?;
    }
    if let Err(e) = ensure_in_flight(&state) {
        coordinator.dispose();
        return Err(e);
    }

    let session = wait_for_outcome(&coordinator).await;
    coordinator.dispose();
    let session = session?;

    println!("{}", serde_json::to_string_pretty(&session)?);
    if let SessionState::Failed { ref error } = session.state {
        if let Some(tx_hash) = session.transaction_hash {
            warn!(%tx_hash, kind = %error.kind, "checkout failed after the transfer was sent");
        }
        bail!(error.user_message());
    }
    Ok(())
}

async fn wait_for_outcome<W, R, B, C>(
    coordinator: &PaymentSessionCoordinator<W, R, B, C>,
) -> Result<PaymentSession>
where
    W: WalletProviderPort + 'static,
    R: ChainRpcPort + 'static,
    B: OrderBackendPort + 'static,
    C: ClockPort + 'static,
{
    let mut updates = coordinator.subscribe();
    let mut ticker = tokio::time::interval(WALLET_SYNC_INTERVAL);
    loop {
        let session = updates.borrow_and_update().clone();
        if session.state.is_terminal() {
            return Ok(session);
        }
        ensure_in_flight(&session.state)?;
        tokio::select! {
            changed = updates.changed() => changed?,
            _ = ticker.tick() => {
                coordinator.sync_wallet_events().await?;
            }
        }
    }
}

/// Before submission nothing advances the session on its own, so there is no outcome to wait for.
fn ensure_in_flight(state: &SessionState) -> Result<()> {
    if state.is_terminal() || state.stage().is_post_submission() {
        return Ok(());
    }
    bail!(
        "checkout stopped at {:?} before the transfer was sent; check the wallet chain and re-run",
        state.stage()
    )
}
