mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{Bytes, B256, U256};

use checkout_settlement_core::{
    ChainId, CoordinatorError, ErrorKind, OrderId, PollStage, PortError, SessionStage,
    SessionState,
};
use common::{
    harness, settle_tasks, wait_for_stage, ScriptedBackend, ScriptedRpc, ScriptedWallet,
};

fn failed_kind(state: &SessionState) -> Option<ErrorKind> {
    match state {
        SessionState::Failed { error } => Some(error.kind),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn settles_a_bsc_payment_end_to_end() {
    let h = harness(
        ScriptedWallet::new(1),
        ScriptedRpc::mined_after(2, true),
        ScriptedBackend::settles_after(1),
    );
    let settled_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&settled_calls);
    h.coordinator
        .on_settled(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("register callback");

    let mut rx = h.coordinator.subscribe();
    let observed = tokio::spawn(async move {
        let mut hashes = Vec::new();
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            hashes.push(snapshot.transaction_hash);
            if snapshot.stage().is_terminal() {
                break;
            }
        }
        hashes
    });

    assert_eq!(
        h.coordinator.connect().await.expect("connect"),
        SessionState::Connected
    );
    let bsc: ChainId = "0x38".parse().expect("bsc chain id");
    assert_eq!(
        h.coordinator.select_chain(bsc).await.expect("select chain"),
        SessionState::ChainSelected
    );
    assert_eq!(h.wallet.active_chain(), 56);

    let tx_hash = B256::repeat_byte(0x11);
    assert_eq!(
        h.coordinator.submit().await.expect("submit"),
        SessionState::AwaitingConfirmation { tx_hash }
    );

    let session = wait_for_stage(&h.coordinator, SessionStage::Settled).await;
    assert_eq!(session.transaction_hash, Some(tx_hash));
    assert_eq!(session.order_id, Some(OrderId("ord_1".to_owned())));
    assert!(session.last_error.is_none());
    assert_eq!(
        session.visited_stages(),
        vec![
            SessionStage::Disconnected,
            SessionStage::Connected,
            SessionStage::ChainSelected,
            SessionStage::Submitting,
            SessionStage::AwaitingConfirmation,
            SessionStage::CreatingOrder,
            SessionStage::AwaitingSettlement,
            SessionStage::Settled,
        ]
    );
    let seqs: Vec<u64> = session.history.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=7).collect::<Vec<u64>>());

    let sent = h.wallet.sent();
    assert_eq!(sent.len(), 1);
    let data: Bytes = serde_json::from_value(sent[0]["data"].clone()).expect("calldata");
    assert_eq!(
        U256::from_be_slice(&data[36..68]),
        U256::from(12_500_000_000_000_000_000u128)
    );

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].chain_id, 56);
    assert_eq!(requests[0].tx_hash, tx_hash);
    assert_eq!(requests[0].amount_minor_units, 1250);
    assert_eq!(requests[0].currency, "USDT");
    assert_eq!(requests[0].agent_id, "agent-7");

    settle_tasks().await;
    assert_eq!(settled_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.coordinator.active_polls(PollStage::Confirmation), 0);
    assert_eq!(h.coordinator.active_polls(PollStage::Settlement), 0);

    let hashes = observed.await.expect("observer task");
    let first_set = hashes
        .iter()
        .position(Option::is_some)
        .expect("hash observed");
    assert!(hashes[first_set..].iter().all(|h| *h == Some(tx_hash)));
}

#[tokio::test(start_paused = true)]
async fn declined_signature_fails_without_hash_or_polls() {
    let h = harness(
        ScriptedWallet::new(56),
        ScriptedRpc::mined_after(0, true),
        ScriptedBackend::settles_after(0),
    );
    h.wallet.push_send_result(Err(PortError::Rejected(
        "User denied transaction signature".to_owned(),
    )));

    h.coordinator.connect().await.expect("connect");
    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("select chain");
    let state = h.coordinator.submit().await.expect("submit");
    assert_eq!(failed_kind(&state), Some(ErrorKind::UserRejected));

    settle_tasks().await;
    let session = h.coordinator.snapshot().expect("snapshot");
    assert!(session.transaction_hash.is_none());
    assert_eq!(
        session.last_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::UserRejected)
    );
    assert_eq!(h.rpc.calls(), 0);
    assert_eq!(h.coordinator.active_polls(PollStage::Confirmation), 0);
    assert!(h.backend.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reverted_transfer_never_reaches_the_backend() {
    let h = harness(
        ScriptedWallet::new(56),
        ScriptedRpc::mined_after(1, false),
        ScriptedBackend::settles_after(0),
    );
    h.coordinator.connect().await.expect("connect");
    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("select chain");
    h.coordinator.submit().await.expect("submit");

    let session = wait_for_stage(&h.coordinator, SessionStage::Failed).await;
    assert_eq!(failed_kind(&session.state), Some(ErrorKind::OnChainRevert));
    assert!(session.transaction_hash.is_some());
    assert!(!session
        .visited_stages()
        .contains(&SessionStage::AwaitingSettlement));

    settle_tasks().await;
    assert!(h.backend.requests().is_empty());
    assert_eq!(h.backend.status_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn order_creation_failure_is_flagged_for_reconciliation() {
    let h = harness(
        ScriptedWallet::new(56),
        ScriptedRpc::mined_after(0, true),
        ScriptedBackend::failing_creation(PortError::Transport("connection refused".to_owned())),
    );
    h.coordinator.connect().await.expect("connect");
    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("select chain");
    h.coordinator.submit().await.expect("submit");

    let session = wait_for_stage(&h.coordinator, SessionStage::Failed).await;
    let error = session.last_error.clone().expect("error recorded");
    assert_eq!(error.kind, ErrorKind::OrderCreationFailed);
    assert!(error.kind.requires_manual_reconciliation());
    assert!(error.message.contains("connection refused"));
    assert!(session.transaction_hash.is_some());
    assert!(session.order_id.is_none());
    assert_ne!(error.kind, ErrorKind::UserRejected);
    assert_ne!(error.kind, ErrorKind::OnChainRevert);
    assert!(error.user_message().contains("Do not pay again"));
}

#[tokio::test(start_paused = true)]
async fn chain_change_before_submit_requires_reselection() {
    let h = harness(
        ScriptedWallet::new(56),
        ScriptedRpc::mined_after(0, true),
        ScriptedBackend::settles_after(0),
    );
    h.coordinator.connect().await.expect("connect");
    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("select chain");

    h.wallet.change_chain(1);
    assert_eq!(h.coordinator.sync_wallet_events().await.expect("sync"), 1);
    let session = h.coordinator.snapshot().expect("snapshot");
    assert_eq!(session.state, SessionState::Connected);
    assert!(session.selected_chain.is_none());

    let err = h.coordinator.submit().await.expect_err("submit refused");
    assert!(matches!(
        err,
        CoordinatorError::InvalidState {
            state: SessionStage::Connected,
            ..
        }
    ));
    assert!(h.wallet.sent().is_empty());

    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("reselect chain");
    let state = h.coordinator.submit().await.expect("submit after reselect");
    assert!(matches!(state, SessionState::AwaitingConfirmation { .. }));
    assert_eq!(h.wallet.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn submit_revalidates_chain_even_without_an_event() {
    let h = harness(
        ScriptedWallet::new(56),
        ScriptedRpc::mined_after(0, true),
        ScriptedBackend::settles_after(0),
    );
    h.coordinator.connect().await.expect("connect");
    h.coordinator
        .select_chain(ChainId::BscMainnet)
        .await
        .expect("select chain");

    // Wallet moved but the event has not been drained yet.
    h.wallet.change_chain(137);
    let state = h.coordinator.submit().await.expect("submit");
    assert_eq!(state, SessionState::Connected);
    assert!(h.wallet.sent().is_empty());
}
