#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};

use checkout_settlement_core::{
    ChainRpcPort, ChargeAmount, CheckoutContext, ClockPort, CoordinatorConfig, OrderBackendPort,
    OrderId, OrderRequest, PaymentSession, PaymentSessionCoordinator, PollPolicy, PortError,
    ProviderEvent, ReceiptStatus, SessionParams, SessionStage, SettlementStatus, WalletChange,
    WalletProviderPort,
};

#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl ClockPort for TestClock {
    fn now_ms(&self) -> Result<u64, PortError> {
        Ok(self.now.fetch_add(1, Ordering::SeqCst) + 1_739_750_400_000)
    }
}

#[derive(Debug)]
struct WalletScript {
    accounts: Result<Vec<Address>, PortError>,
    chain_id: u64,
    known_chains: HashSet<u64>,
    reject_switch: bool,
    ignore_switch: bool,
    send_results: VecDeque<Result<B256, PortError>>,
    sent: Vec<Value>,
    added: Vec<Value>,
    events: Vec<ProviderEvent>,
    next_sequence: u64,
}

/// In-process wallet whose answers are scripted per test.
#[derive(Debug)]
pub struct ScriptedWallet {
    script: Mutex<WalletScript>,
}

impl ScriptedWallet {
    pub fn new(chain_id: u64) -> Self {
        Self {
            script: Mutex::new(WalletScript {
                accounts: Ok(vec![buyer()]),
                chain_id,
                known_chains: [1u64, 56, 137, 11_155_111].into_iter().collect(),
                reject_switch: false,
                ignore_switch: false,
                send_results: VecDeque::new(),
                sent: Vec::new(),
                added: Vec::new(),
                events: Vec::new(),
                next_sequence: 0,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut WalletScript) -> T) -> T {
        f(&mut self.script.lock().expect("wallet script lock"))
    }

    pub fn set_accounts(&self, accounts: Result<Vec<Address>, PortError>) {
        self.with(|s| s.accounts = accounts);
    }

    pub fn forget_chain(&self, chain_id: u64) {
        self.with(|s| s.known_chains.remove(&chain_id));
    }

    pub fn reject_switch(&self) {
        self.with(|s| s.reject_switch = true);
    }

    /// Switch requests succeed without moving the wallet.
    pub fn ignore_switch(&self) {
        self.with(|s| s.ignore_switch = true);
    }

    pub fn push_send_result(&self, result: Result<B256, PortError>) {
        self.with(|s| s.send_results.push_back(result));
    }

    pub fn active_chain(&self) -> u64 {
        self.with(|s| s.chain_id)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.with(|s| s.sent.clone())
    }

    pub fn added(&self) -> Vec<Value> {
        self.with(|s| s.added.clone())
    }

    /// Moves the wallet and records a `chainChanged` event.
    pub fn change_chain(&self, chain_id: u64) {
        self.with(|s| {
            s.chain_id = chain_id;
            s.next_sequence += 1;
            let sequence = s.next_sequence;
            s.events.push(ProviderEvent {
                sequence,
                change: WalletChange::ChainChanged(chain_id),
            });
        });
    }

    pub fn change_accounts(&self, accounts: Vec<Address>) {
        self.with(|s| {
            s.next_sequence += 1;
            let sequence = s.next_sequence;
            s.events.push(ProviderEvent {
                sequence,
                change: WalletChange::AccountsChanged(accounts),
            });
        });
    }
}

#[async_trait]
impl WalletProviderPort for ScriptedWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, PortError> {
        self.with(|s| s.accounts.clone())
    }

    async fn chain_id(&self) -> Result<u64, PortError> {
        Ok(self.with(|s| s.chain_id))
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), PortError> {
        self.with(|s| {
            if s.reject_switch {
                return Err(PortError::Rejected("user rejected the request".to_owned()));
            }
            if !s.known_chains.contains(&chain_id) {
                return Err(PortError::UnrecognizedChain(chain_id));
            }
            if !s.ignore_switch {
                s.chain_id = chain_id;
            }
            Ok(())
        })
    }

    async fn add_chain(&self, params: &Value) -> Result<(), PortError> {
        let hex = params["chainId"]
            .as_str()
            .ok_or_else(|| PortError::Validation("chainId missing".to_owned()))?;
        let chain_id = u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| PortError::Validation(e.to_string()))?;
        self.with(|s| {
            s.known_chains.insert(chain_id);
            s.added.push(params.clone());
        });
        Ok(())
    }

    async fn send_transaction(&self, tx_payload: &Value) -> Result<B256, PortError> {
        self.with(|s| {
            s.sent.push(tx_payload.clone());
            s.send_results
                .pop_front()
                .unwrap_or_else(|| Ok(B256::repeat_byte(0x11)))
        })
    }

    fn drain_events(&self) -> Result<Vec<ProviderEvent>, PortError> {
        Ok(self.with(|s| std::mem::take(&mut s.events)))
    }
}

/// Receipt lookups answered from a queue; `Ok(None)` once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedRpc {
    answers: Mutex<VecDeque<Result<Option<ReceiptStatus>, PortError>>>,
    calls: AtomicUsize,
}

impl ScriptedRpc {
    pub fn mined_after(pending: usize, success: bool) -> Self {
        let rpc = Self::default();
        for _ in 0..pending {
            rpc.push(Ok(None));
        }
        rpc.push(Ok(Some(ReceiptStatus {
            success,
            block_number: Some(42),
        })));
        rpc
    }

    pub fn never_mined() -> Self {
        Self::default()
    }

    pub fn push(&self, answer: Result<Option<ReceiptStatus>, PortError>) {
        self.answers.lock().expect("rpc lock").push_back(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainRpcPort for ScriptedRpc {
    async fn transaction_receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptStatus>, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .expect("rpc lock")
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

#[derive(Debug)]
pub struct ScriptedBackend {
    create_result: Mutex<Result<OrderId, PortError>>,
    statuses: Mutex<VecDeque<Result<SettlementStatus, PortError>>>,
    requests: Mutex<Vec<OrderRequest>>,
    status_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn settles_after(pending: usize) -> Self {
        let backend = Self::never_settles();
        for _ in 0..pending {
            backend.push_status(Ok(SettlementStatus::Pending));
        }
        backend.push_status(Ok(SettlementStatus::Succeeded));
        backend
    }

    /// Creates `ord_1` and reports it pending forever.
    pub fn never_settles() -> Self {
        Self::with_create_result(Ok(OrderId("ord_1".to_owned())))
    }

    pub fn failing_creation(error: PortError) -> Self {
        Self::with_create_result(Err(error))
    }

    fn with_create_result(result: Result<OrderId, PortError>) -> Self {
        Self {
            create_result: Mutex::new(result),
            statuses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_status(&self, status: Result<SettlementStatus, PortError>) {
        self.statuses.lock().expect("backend lock").push_back(status);
    }

    pub fn requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().expect("backend lock").clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderBackendPort for ScriptedBackend {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderId, PortError> {
        self.requests
            .lock()
            .expect("backend lock")
            .push(request.clone());
        self.create_result.lock().expect("backend lock").clone()
    }

    async fn order_status(&self, _order_id: &OrderId) -> Result<SettlementStatus, PortError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .expect("backend lock")
            .pop_front()
            .unwrap_or(Ok(SettlementStatus::Pending))
    }
}

pub type TestCoordinator =
    PaymentSessionCoordinator<ScriptedWallet, ScriptedRpc, ScriptedBackend, TestClock>;

pub struct Harness {
    pub coordinator: TestCoordinator,
    pub wallet: Arc<ScriptedWallet>,
    pub rpc: Arc<ScriptedRpc>,
    pub backend: Arc<ScriptedBackend>,
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        confirmation: PollPolicy {
            max_wait: Some(Duration::from_secs(60)),
            ..PollPolicy::fixed(Duration::from_secs(2))
        },
        settlement: PollPolicy {
            max_wait: Some(Duration::from_secs(90)),
            ..PollPolicy::fixed(Duration::from_secs(3))
        },
    }
}

pub fn harness(wallet: ScriptedWallet, rpc: ScriptedRpc, backend: ScriptedBackend) -> Harness {
    harness_with_config(wallet, rpc, backend, fast_config())
}

pub fn harness_with_config(
    wallet: ScriptedWallet,
    rpc: ScriptedRpc,
    backend: ScriptedBackend,
    config: CoordinatorConfig,
) -> Harness {
    let wallet = Arc::new(wallet);
    let rpc = Arc::new(rpc);
    let backend = Arc::new(backend);
    let coordinator = PaymentSessionCoordinator::new(
        Arc::clone(&wallet),
        Arc::clone(&rpc),
        Arc::clone(&backend),
        Arc::new(TestClock::default()),
        SessionParams::new(checkout(), charge(), merchant()).with_session_id("cs-test"),
        config,
    )
    .expect("coordinator");
    Harness {
        coordinator,
        wallet,
        rpc,
        backend,
    }
}

pub fn checkout() -> CheckoutContext {
    CheckoutContext {
        agent_id: "agent-7".to_owned(),
        user_id: "user-42".to_owned(),
        cart: json!({"items": [{"sku": "tool-pro", "qty": 1}]}),
    }
}

pub fn charge() -> ChargeAmount {
    ChargeAmount::new(1250, 2, "USDT")
}

pub fn buyer() -> Address {
    "0x1000000000000000000000000000000000000001"
        .parse()
        .expect("valid buyer address")
}

pub fn merchant() -> Address {
    "0x000000000000000000000000000000000000BEEF"
        .parse()
        .expect("valid merchant address")
}

/// Waits (in paused time) until the session reaches `stage`.
pub async fn wait_for_stage(coordinator: &TestCoordinator, stage: SessionStage) -> PaymentSession {
    let mut rx = coordinator.subscribe();
    let session = tokio::time::timeout(
        Duration::from_secs(3_600),
        rx.wait_for(|session| session.stage() == stage),
    )
    .await
    .expect("stage reached before timeout")
    .expect("coordinator alive")
    .clone();
    session
}

/// Lets spawned poll tasks run without advancing past their next timer.
pub async fn settle_tasks() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
