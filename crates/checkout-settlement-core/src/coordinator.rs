//! Drives one [`PaymentSession`] from wallet connection to backend settlement.
//!
//! All session data sits behind a single mutex that is never held across an `.await`. Every
//! state change goes through [`session_transition`] inside that lock; effects that start or stop
//! polls are executed in the same critical section, while effects that call out (order creation,
//! the success callback) run after it is released.
//!
//! Poll tasks hold only a weak reference to the session. A poll result is applied only if the
//! session is still alive, not disposed, and the poll's epoch is still the current one for its
//! stage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use alloy::primitives::{Address, B256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainId, ChainRegistry, RegistryError};
use crate::confirmation::{ConfirmationUpdate, ConfirmationWatcher};
use crate::domain::{
    ChargeAmount, CheckoutContext, ErrorKind, OrderId, OrderRequest, PaymentSession,
    ProviderEvent, SessionError, SessionId, SessionStage, SessionState, TimestampMs,
    TransitionRecord, WalletChange,
};
use crate::gateway::{ChainCheck, ConnectOutcome, SwitchOutcome, WalletGateway};
use crate::poll::{PollHandle, PollPolicy, PollSlots, PollStage};
use crate::ports::{ChainRpcPort, ClockPort, OrderBackendPort, PortError, WalletProviderPort};
use crate::settlement::{SettlementPoller, SettlementUpdate};
use crate::state_machine::{session_transition, Effect, SessionEvent, Transition, TransitionError};
use crate::submitter::{SubmitOutcome, TransferSubmitter};

/// What subscribers receive on every accepted transition.
pub type SessionSnapshot = PaymentSession;

type SettledCallback = Box<dyn FnOnce(&PaymentSession) + Send>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionStage,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("session has been disposed")]
    Disposed,
    #[error("{stage:?} poll result is no longer current")]
    StalePoll { stage: PollStage },
    #[error("{field} is already set for this session")]
    AlreadySet { field: &'static str },
    #[error("lock error: {0}")]
    Lock(String),
    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorConfig {
    pub confirmation: PollPolicy,
    pub settlement: PollPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirmation: PollPolicy::confirmation_default(),
            settlement: PollPolicy::settlement_default(),
        }
    }
}

/// Fixed inputs of a checkout attempt.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: Option<SessionId>,
    pub checkout: CheckoutContext,
    pub charge: ChargeAmount,
    pub recipient: Address,
}

impl SessionParams {
    pub fn new(checkout: CheckoutContext, charge: ChargeAmount, recipient: Address) -> Self {
        Self {
            session_id: None,
            checkout,
            charge,
            recipient,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(SessionId(id.into()));
        self
    }
}

#[derive(Debug)]
struct SessionCore {
    session: PaymentSession,
    polls: PollSlots,
    disposed: bool,
    last_event_sequence: Option<u64>,
}

enum Patch {
    Nothing,
    Attach(Address),
    Detach,
    Chain(ChainId),
    TxHash(B256),
    Order(OrderId),
}

impl Patch {
    fn of(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::WalletConnected { address } => Patch::Attach(*address),
            SessionEvent::WalletDisconnected => Patch::Detach,
            SessionEvent::ChainSelected { chain } => Patch::Chain(*chain),
            SessionEvent::TransferSubmitted { tx_hash } => Patch::TxHash(*tx_hash),
            SessionEvent::OrderCreated { order_id } => Patch::Order(order_id.clone()),
            _ => Patch::Nothing,
        }
    }
}

struct Inner<W, R, B, C> {
    gateway: WalletGateway<W>,
    submitter: TransferSubmitter<W>,
    confirmations: ConfirmationWatcher<R>,
    settlements: SettlementPoller<B>,
    backend: Arc<B>,
    clock: Arc<C>,
    registry: ChainRegistry,
    core: Mutex<SessionCore>,
    updates: watch::Sender<SessionSnapshot>,
    on_settled: Mutex<Option<SettledCallback>>,
}

/// Owns one checkout attempt. Cheap to clone; all clones share the same session.
pub struct PaymentSessionCoordinator<W, R, B, C> {
    inner: Arc<Inner<W, R, B, C>>,
}

impl<W, R, B, C> Clone for PaymentSessionCoordinator<W, R, B, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W, R, B, C> PaymentSessionCoordinator<W, R, B, C>
where
    W: WalletProviderPort + 'static,
    R: ChainRpcPort + 'static,
    B: OrderBackendPort + 'static,
    C: ClockPort + 'static,
{
    pub fn new(
        provider: Arc<W>,
        rpc: Arc<R>,
        backend: Arc<B>,
        clock: Arc<C>,
        params: SessionParams,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let now = clock.now_ms()?;
        let id = params.session_id.unwrap_or_else(|| generate_session_id(now));
        let session = PaymentSession::new(
            id,
            params.checkout,
            params.charge,
            params.recipient,
            TimestampMs(now),
        );
        let (updates, _) = watch::channel(session.clone());
        info!(session_id = %session.id, charge = %session.charge, "payment session created");
        Ok(Self {
            inner: Arc::new(Inner {
                gateway: WalletGateway::new(Arc::clone(&provider)),
                submitter: TransferSubmitter::new(provider),
                confirmations: ConfirmationWatcher::new(rpc, config.confirmation),
                settlements: SettlementPoller::new(Arc::clone(&backend), config.settlement),
                backend,
                clock,
                registry: ChainRegistry,
                core: Mutex::new(SessionCore {
                    session,
                    polls: PollSlots::default(),
                    disposed: false,
                    last_event_sequence: None,
                }),
                updates,
                on_settled: Mutex::new(None),
            }),
        })
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, CoordinatorError> {
        Ok(self.inner.lock()?.session.clone())
    }

    pub fn state(&self) -> Result<SessionState, CoordinatorError> {
        Ok(self.inner.lock()?.session.state.clone())
    }

    /// Receives a snapshot after every accepted transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    /// Registers the success callback. It runs at most once, when the session reaches `Settled`
    /// (immediately if it already has), and never after `dispose()`.
    pub fn on_settled<F>(&self, callback: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(&PaymentSession) + Send + 'static,
    {
        // Checked and stored under the session lock so a concurrent `Settled` cannot slip between.
        let settled = {
            let core = self.inner.lock()?;
            if core.disposed {
                return Err(CoordinatorError::Disposed);
            }
            if core.session.stage() != SessionStage::Settled {
                let mut slot = self
                    .inner
                    .on_settled
                    .lock()
                    .map_err(|_| CoordinatorError::Lock("callback lock poisoned".to_owned()))?;
                *slot = Some(Box::new(callback));
                return Ok(());
            }
            core.session.clone()
        };
        callback(&settled);
        Ok(())
    }

    pub async fn connect(&self) -> Result<SessionState, CoordinatorError> {
        self.inner.require("connect", |stage| stage == SessionStage::Disconnected)?;
        match self.inner.gateway.connect().await {
            ConnectOutcome::Connected { address } => {
                self.inner
                    .dispatch(SessionEvent::WalletConnected { address }, None)
                    .await?;
            }
            outcome => {
                if let Some(error) = outcome.into_error() {
                    warn!(kind = %error.kind, message = %error.message, "wallet connection failed");
                    self.inner.dispatch(SessionEvent::Abort(error), None).await?;
                }
            }
        }
        self.state()
    }

    pub async fn select_chain(&self, chain: ChainId) -> Result<SessionState, CoordinatorError> {
        self.inner.require("select a chain", |stage| {
            matches!(stage, SessionStage::Connected | SessionStage::ChainSelected)
        })?;
        let descriptor = self.inner.registry.describe(chain);
        match self.inner.gateway.switch_or_add_chain(descriptor).await {
            SwitchOutcome::Switched => {
                info!(%chain, "wallet on selected chain");
                self.inner
                    .dispatch(SessionEvent::ChainSelected { chain }, None)
                    .await?;
            }
            outcome => {
                if let Some(error) = outcome.into_error() {
                    warn!(%chain, kind = %error.kind, message = %error.message, "chain selection failed");
                    self.inner.dispatch(SessionEvent::Abort(error), None).await?;
                }
            }
        }
        self.state()
    }

    /// Like [`Self::select_chain`] for a raw EIP-155 id. Unknown ids leave the session untouched.
    pub async fn select_chain_id(&self, raw_chain_id: u64) -> Result<SessionState, CoordinatorError> {
        let descriptor = self.inner.registry.lookup(raw_chain_id)?;
        self.select_chain(descriptor.id).await
    }

    /// Re-validates the wallet's chain, then hands the transfer to the wallet.
    ///
    /// A no-op once the session has left `ChainSelected`, so a second call while the first is in
    /// flight never submits twice.
    pub async fn submit(&self) -> Result<SessionState, CoordinatorError> {
        let (chain, from, recipient, charge) = {
            let core = self.inner.lock()?;
            if core.disposed {
                return Err(CoordinatorError::Disposed);
            }
            let stage = core.session.stage();
            match stage {
                SessionStage::ChainSelected => {}
                SessionStage::Disconnected | SessionStage::Connected => {
                    return Err(CoordinatorError::InvalidState {
                        operation: "submit",
                        state: stage,
                    })
                }
                _ => {
                    debug!(session_id = %core.session.id, ?stage, "submit ignored; already past chain selection");
                    return Ok(core.session.state.clone());
                }
            }
            let (Some(chain), Some(from)) = (core.session.selected_chain, core.session.wallet_address)
            else {
                return Err(CoordinatorError::InvalidState {
                    operation: "submit",
                    state: stage,
                });
            };
            (chain, from, core.session.recipient, core.session.charge.clone())
        };

        let descriptor = self.inner.registry.describe(chain);
        match self.inner.gateway.ensure_chain(descriptor).await {
            Ok(ChainCheck::Matches) => {}
            Ok(ChainCheck::Mismatch { expected, actual }) => {
                warn!(%chain, actual, "wallet left the selected chain before submission");
                self.inner
                    .dispatch(SessionEvent::WalletChainChanged { active: actual, expected }, None)
                    .await?;
                return self.state();
            }
            Err(e) => {
                let error = SessionError::new(
                    ErrorKind::ChainSwitchFailed,
                    format!("could not confirm active chain: {e}"),
                );
                self.inner.dispatch(SessionEvent::Abort(error), None).await?;
                return self.state();
            }
        }

        match self.inner.apply(SessionEvent::SubmitStarted, None) {
            Ok(_) => {}
            Err(CoordinatorError::Transition(TransitionError::Illegal { from, .. })) => {
                debug!(?from, "submit lost the race to another transition");
                return self.state();
            }
            Err(e) => return Err(e),
        }

        let event = match self
            .inner
            .submitter
            .submit(descriptor, from, recipient, &charge)
            .await
        {
            SubmitOutcome::Submitted { tx_hash } => SessionEvent::TransferSubmitted { tx_hash },
            outcome => match outcome.into_error() {
                Some(error) => SessionEvent::Abort(error),
                None => SessionEvent::Abort(SessionError::new(
                    ErrorKind::Unknown,
                    "wallet returned no outcome",
                )),
            },
        };
        let submitted = match &event {
            SessionEvent::TransferSubmitted { tx_hash } => Some(*tx_hash),
            _ => None,
        };
        if let Err(e) = self.inner.dispatch(event, None).await {
            if let (CoordinatorError::Disposed, Some(tx_hash)) = (&e, submitted) {
                error!(%tx_hash, "transfer submitted after the session was disposed");
            }
            return Err(e);
        }
        self.state()
    }

    /// Applies one wallet-originated change. Events at or below the last seen sequence are
    /// skipped.
    pub async fn handle_wallet_event(&self, event: &ProviderEvent) -> Result<(), CoordinatorError> {
        let (stage, selected, attached) = {
            let mut core = self.inner.lock()?;
            if core.disposed {
                return Err(CoordinatorError::Disposed);
            }
            if core
                .last_event_sequence
                .is_some_and(|last| event.sequence <= last)
            {
                return Ok(());
            }
            core.last_event_sequence = Some(event.sequence);
            (
                core.session.stage(),
                core.session.selected_chain,
                core.session.wallet_address,
            )
        };
        if stage.is_terminal() || stage.is_post_submission() {
            debug!(sequence = event.sequence, ?stage, "wallet event ignored after submission");
            return Ok(());
        }

        match &event.change {
            WalletChange::ChainChanged(reported) => {
                let Some(chain) = selected else {
                    return Ok(());
                };
                // Events can echo an earlier switch; judge against where the wallet is now.
                let active = match self.inner.gateway.current_chain().await {
                    Ok(active) => active,
                    Err(e) => {
                        warn!(error = %e, reported, "could not re-read wallet chain; trusting event");
                        *reported
                    }
                };
                if active != *reported {
                    debug!(sequence = event.sequence, reported, active, "superseded chain event");
                }
                self.inner
                    .dispatch(
                        SessionEvent::WalletChainChanged {
                            active,
                            expected: chain.as_u64(),
                        },
                        None,
                    )
                    .await
            }
            WalletChange::AccountsChanged(accounts) => match accounts.first() {
                None => {
                    self.inner.gateway.disconnect();
                    self.inner
                        .dispatch(SessionEvent::WalletDisconnected, None)
                        .await
                }
                Some(address) if stage != SessionStage::Disconnected && attached != Some(*address) => {
                    info!(%address, "wallet switched account");
                    self.inner.gateway.attach(Some(*address));
                    self.inner.update(|session| session.wallet_address = Some(*address))
                }
                Some(_) => Ok(()),
            },
        }
    }

    /// Drains pending provider events and applies them in order.
    pub async fn sync_wallet_events(&self) -> Result<usize, CoordinatorError> {
        let events = self.inner.gateway.drain_events()?;
        let count = events.len();
        for event in &events {
            self.handle_wallet_event(event).await?;
        }
        Ok(count)
    }

    /// Detaches the wallet. Before submission the session returns to `Disconnected`; afterwards
    /// only the address is cleared and the in-flight payment keeps going.
    pub async fn disconnect(&self) -> Result<SessionState, CoordinatorError> {
        self.inner.gateway.disconnect();
        let stage = self.inner.lock()?.session.stage();
        match stage {
            SessionStage::Disconnected => {}
            SessionStage::Connected | SessionStage::ChainSelected => {
                self.inner
                    .dispatch(SessionEvent::WalletDisconnected, None)
                    .await?;
            }
            _ => self.inner.update(|session| session.wallet_address = None)?,
        }
        self.state()
    }

    /// Leaves `Failed` for the furthest pre-submission stage the retained wallet attachment
    /// supports. Refused once a transaction hash exists.
    pub async fn reset(&self) -> Result<SessionState, CoordinatorError> {
        let to = {
            let core = self.inner.lock()?;
            let stage = core.session.stage();
            if stage != SessionStage::Failed || core.session.transaction_hash.is_some() {
                return Err(CoordinatorError::InvalidState {
                    operation: "reset",
                    state: stage,
                });
            }
            match (core.session.wallet_address, core.session.selected_chain) {
                (Some(_), Some(_)) => SessionStage::ChainSelected,
                (Some(_), None) => SessionStage::Connected,
                _ => SessionStage::Disconnected,
            }
        };
        self.inner.dispatch(SessionEvent::Reset { to }, None).await?;
        self.state()
    }

    /// Stops all background work. No transition is applied and no callback fires afterwards.
    pub fn dispose(&self) {
        let session_id = match self.inner.core.lock() {
            Ok(mut core) => {
                core.disposed = true;
                core.polls.cancel_all();
                core.session.id.clone()
            }
            Err(poisoned) => {
                let mut core = poisoned.into_inner();
                core.disposed = true;
                core.polls.cancel_all();
                core.session.id.clone()
            }
        };
        if let Ok(mut slot) = self.inner.on_settled.lock() {
            slot.take();
        }
        info!(%session_id, "payment session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().map(|core| core.disposed).unwrap_or(true)
    }

    pub fn active_polls(&self, stage: PollStage) -> usize {
        self.inner
            .lock()
            .map(|core| core.polls.active(stage))
            .unwrap_or(0)
    }
}

impl<W, R, B, C> Inner<W, R, B, C>
where
    W: WalletProviderPort + 'static,
    R: ChainRpcPort + 'static,
    B: OrderBackendPort + 'static,
    C: ClockPort + 'static,
{
    fn lock(&self) -> Result<MutexGuard<'_, SessionCore>, CoordinatorError> {
        self.core
            .lock()
            .map_err(|_| CoordinatorError::Lock("session lock poisoned".to_owned()))
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: impl Fn(SessionStage) -> bool,
    ) -> Result<(), CoordinatorError> {
        let core = self.lock()?;
        if core.disposed {
            return Err(CoordinatorError::Disposed);
        }
        let stage = core.session.stage();
        if allowed(stage) {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidState {
                operation,
                state: stage,
            })
        }
    }

    /// Field update that is not a state change (account switch, post-submission detach).
    fn update(&self, change: impl FnOnce(&mut PaymentSession)) -> Result<(), CoordinatorError> {
        let now = self.clock.now_ms()?;
        let mut core = self.lock()?;
        if core.disposed {
            return Err(CoordinatorError::Disposed);
        }
        change(&mut core.session);
        core.session.updated_at_ms = TimestampMs(now);
        self.updates.send_replace(core.session.clone());
        Ok(())
    }

    async fn dispatch(
        self: &Arc<Self>,
        event: SessionEvent,
        origin: Option<(PollStage, u64)>,
    ) -> Result<(), CoordinatorError> {
        let deferred = self.apply(event, origin)?;
        self.run_deferred(deferred).await;
        Ok(())
    }

    /// Runs one transition under the session lock and returns the effects that must run after
    /// the lock is released.
    fn apply(
        self: &Arc<Self>,
        event: SessionEvent,
        origin: Option<(PollStage, u64)>,
    ) -> Result<VecDeque<Effect>, CoordinatorError> {
        let now = self.clock.now_ms()?;
        let mut core = self.lock()?;
        if core.disposed {
            return Err(CoordinatorError::Disposed);
        }
        if let Some((stage, epoch)) = origin {
            if core.polls.current_epoch(stage) != Some(epoch) {
                return Err(CoordinatorError::StalePoll { stage });
            }
        }

        let patch = Patch::of(&event);
        let event_name = event.name();
        let Some(transition) = session_transition(&core.session.state, event)? else {
            debug!(session_id = %core.session.id, event = event_name, "event has no effect");
            return Ok(VecDeque::new());
        };
        commit(&mut core.session, &transition, patch, now)?;

        let Transition {
            from,
            next,
            effects,
            reason,
        } = transition;
        let to = next.stage();
        match &next {
            SessionState::Failed { error } if error.kind.requires_manual_reconciliation() => {
                error!(
                    session_id = %core.session.id,
                    tx_hash = ?core.session.transaction_hash,
                    order_id = ?core.session.order_id,
                    kind = %error.kind,
                    message = %error.message,
                    "payment needs manual reconciliation"
                );
            }
            SessionState::Failed { error } => {
                warn!(session_id = %core.session.id, ?from, kind = %error.kind, message = %error.message, "payment attempt failed");
            }
            _ => {
                info!(session_id = %core.session.id, ?from, ?to, reason, "session transition");
            }
        }

        let caller_epoch = |stage: PollStage| {
            origin.and_then(|(origin_stage, epoch)| (origin_stage == stage).then_some(epoch))
        };
        let mut deferred = VecDeque::new();
        for effect in effects {
            match effect {
                Effect::StartConfirmationPoll { tx_hash } => {
                    self.start_confirmation_poll(&mut core, tx_hash);
                }
                Effect::CancelConfirmationPoll => core
                    .polls
                    .clear(PollStage::Confirmation, caller_epoch(PollStage::Confirmation)),
                Effect::StartSettlementPoll { order_id } => {
                    self.start_settlement_poll(&mut core, order_id);
                }
                Effect::CancelSettlementPoll => core
                    .polls
                    .clear(PollStage::Settlement, caller_epoch(PollStage::Settlement)),
                other => deferred.push_back(other),
            }
        }
        if to.is_terminal() {
            core.polls
                .clear(PollStage::Confirmation, caller_epoch(PollStage::Confirmation));
            core.polls
                .clear(PollStage::Settlement, caller_epoch(PollStage::Settlement));
        }

        self.updates.send_replace(core.session.clone());
        Ok(deferred)
    }

    async fn run_deferred(self: &Arc<Self>, mut queue: VecDeque<Effect>) {
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::CreateOrder { tx_hash } => {
                    let event = self.create_order(tx_hash).await;
                    match self.apply(event, None) {
                        Ok(more) => queue.extend(more),
                        Err(e) => {
                            warn!(%tx_hash, error = %e, "order creation result not applied");
                        }
                    }
                }
                Effect::NotifySettled => self.notify_settled(),
                other => debug!(?other, "effect already handled"),
            }
        }
    }

    async fn create_order(&self, tx_hash: B256) -> SessionEvent {
        let request = match self.lock() {
            Ok(core) => match core.session.selected_chain {
                Some(chain) => OrderRequest {
                    agent_id: core.session.checkout.agent_id.clone(),
                    user_id: core.session.checkout.user_id.clone(),
                    amount_minor_units: core.session.charge.minor_units,
                    currency: core.session.charge.currency.clone(),
                    chain_id: chain.as_u64(),
                    tx_hash,
                    cart: core.session.checkout.cart.clone(),
                },
                None => {
                    return SessionEvent::OrderCreationFailed {
                        message: "no chain recorded for the confirmed transfer".to_owned(),
                    }
                }
            },
            Err(e) => {
                return SessionEvent::OrderCreationFailed {
                    message: e.to_string(),
                }
            }
        };
        info!(%tx_hash, chain = request.chain_id, "creating order for confirmed transfer");
        match self.backend.create_order(&request).await {
            Ok(order_id) => SessionEvent::OrderCreated { order_id },
            Err(e) => SessionEvent::OrderCreationFailed {
                message: e.to_string(),
            },
        }
    }

    fn notify_settled(&self) {
        // The callback is claimed under the session lock, so `dispose` either sees it taken or
        // wins the race and drops it first.
        let (session, callback) = {
            let core = match self.lock() {
                Ok(core) if !core.disposed => core,
                _ => return,
            };
            let callback = match self.on_settled.lock() {
                Ok(mut slot) => slot.take(),
                Err(_) => None,
            };
            (core.session.clone(), callback)
        };
        if let Some(callback) = callback {
            info!(session_id = %session.id, order_id = ?session.order_id, "notifying settlement");
            callback(&session);
        }
    }

    fn start_confirmation_poll(self: &Arc<Self>, core: &mut SessionCore, tx_hash: B256) {
        let epoch = core.polls.next_epoch();
        let weak = Arc::downgrade(self);
        let mut watch = self.confirmations.watch(tx_hash);
        info!(session_id = %core.session.id, %tx_hash, epoch, "confirmation poll started");
        let task = tokio::spawn(async move {
            while let Some(update) = watch.next().await {
                let event = match update {
                    ConfirmationUpdate::Pending { attempt } => {
                        debug!(%tx_hash, attempt, "transaction not mined yet");
                        if weak.strong_count() == 0 {
                            return;
                        }
                        continue;
                    }
                    ConfirmationUpdate::Mined { success } => SessionEvent::ReceiptMined { success },
                    ConfirmationUpdate::Stuck { waited } => {
                        SessionEvent::ConfirmationStuck { waited }
                    }
                };
                deliver(&weak, event, PollStage::Confirmation, epoch).await;
                return;
            }
        });
        core.polls
            .install(PollHandle::new(PollStage::Confirmation, epoch, task));
    }

    fn start_settlement_poll(self: &Arc<Self>, core: &mut SessionCore, order_id: OrderId) {
        let epoch = core.polls.next_epoch();
        let weak = Arc::downgrade(self);
        let mut watch = self.settlements.watch(order_id.clone());
        info!(session_id = %core.session.id, %order_id, epoch, "settlement poll started");
        let task = tokio::spawn(async move {
            while let Some(update) = watch.next().await {
                let event = match update {
                    SettlementUpdate::Pending { attempt } => {
                        debug!(%order_id, attempt, "order not settled yet");
                        if weak.strong_count() == 0 {
                            return;
                        }
                        continue;
                    }
                    SettlementUpdate::Succeeded => SessionEvent::SettlementSucceeded,
                    SettlementUpdate::Failed { reason } => SessionEvent::SettlementFailed { reason },
                    SettlementUpdate::Stuck { waited } => SessionEvent::SettlementStuck { waited },
                };
                deliver(&weak, event, PollStage::Settlement, epoch).await;
                return;
            }
        });
        core.polls
            .install(PollHandle::new(PollStage::Settlement, epoch, task));
    }
}

async fn deliver<W, R, B, C>(
    weak: &Weak<Inner<W, R, B, C>>,
    event: SessionEvent,
    stage: PollStage,
    epoch: u64,
) where
    W: WalletProviderPort + 'static,
    R: ChainRpcPort + 'static,
    B: OrderBackendPort + 'static,
    C: ClockPort + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if let Err(e) = inner.dispatch(event, Some((stage, epoch))).await {
        debug!(?stage, epoch, error = %e, "poll result discarded");
    }
}

fn commit(
    session: &mut PaymentSession,
    transition: &Transition,
    patch: Patch,
    now: u64,
) -> Result<(), CoordinatorError> {
    match patch {
        Patch::Nothing => {}
        Patch::Attach(address) => session.wallet_address = Some(address),
        Patch::Detach => {
            session.wallet_address = None;
            session.selected_chain = None;
        }
        Patch::Chain(chain) => session.selected_chain = Some(chain),
        Patch::TxHash(tx_hash) => match session.transaction_hash {
            Some(existing) if existing != tx_hash => {
                return Err(CoordinatorError::AlreadySet {
                    field: "transaction_hash",
                })
            }
            _ => session.transaction_hash = Some(tx_hash),
        },
        Patch::Order(order_id) => match &session.order_id {
            Some(existing) if *existing != order_id => {
                return Err(CoordinatorError::AlreadySet { field: "order_id" })
            }
            _ => session.order_id = Some(order_id),
        },
    }
    if transition.from == SessionStage::ChainSelected && transition.to() == SessionStage::Connected
    {
        session.selected_chain = None;
    }

    session.last_error = match &transition.next {
        SessionState::Failed { error } => Some(error.clone()),
        _ => None,
    };
    session.state = transition.next.clone();
    session.updated_at_ms = TimestampMs(now);
    let seq = session.history.len() as u64 + 1;
    session.history.push(TransitionRecord {
        seq,
        from: transition.from,
        to: transition.to(),
        reason: transition.reason.to_owned(),
        recorded_at_ms: TimestampMs(now),
    });
    Ok(())
}

fn generate_session_id(now_ms: u64) -> SessionId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    SessionId(format!("cs-{now_ms:x}-{n:04x}"))
}
