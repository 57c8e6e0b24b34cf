//! Record and Balance Push Tests
//!
//! Verifies:
//! - Local record round-trips and persistence across restarts
//! - Record mutations are pushed directly online and replayed after offline edits
//! - Pushed authoritative balances are applied by the background reconciler
//! - Balance change callbacks fire for optimistic and confirmed changes

mod common;

use common::{create_test_env, reopen, wait_until, FakeLedger, USER};
use creditsync::{
    AuthoritativeBalance, BalanceChangeCause, ClientServices, ManualClock, OfflineClient,
    PushBalanceSource, RecordOp, RemoteError, SyncError,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_record_round_trip_and_restart() {
    let tmp = TempDir::new().unwrap();
    let env = create_test_env(&tmp, 0, false);

    let values = [
        ("plot:1", json!({"crop": "maize", "area_ha": 2.5})),
        ("plot:2", json!(["a", "b"])),
        ("note", json!("water on tuesday")),
        ("empty", json!(null)),
    ];
    for (key, value) in &values {
        env.client.save_record(key, value.clone()).await.unwrap();
    }
    for (key, value) in &values {
        assert_eq!(env.client.get_record(key).unwrap().as_ref(), Some(value));
    }
    assert_eq!(env.client.get_record("missing").unwrap(), None);

    let server = env.server.clone();
    let clock = env.clock.clone();
    drop(env);

    let env = reopen(&tmp, server, false, clock);
    assert_eq!(
        env.client.get_record("plot:1").unwrap(),
        Some(json!({"crop": "maize", "area_ha": 2.5}))
    );
    // One queued upsert per save survives the restart as well
    assert_eq!(env.client.pending_entries().unwrap().len(), values.len());
}

#[tokio::test]
async fn test_record_pushed_directly_when_online() {
    let tmp = TempDir::new().unwrap();
    let env = create_test_env(&tmp, 0, true);

    env.client.save_record("plot:1", json!({"crop": "beans"})).await.unwrap();
    let pushed = env.records.pushed.lock().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].op, RecordOp::Upsert);
    assert!(env.client.pending_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_record_push_keeps_local_copy() {
    let tmp = TempDir::new().unwrap();
    let env = create_test_env(&tmp, 0, true);
    env.records
        .script(vec![Err(RemoteError::Rejected("schema".to_string()))]);

    let result = env.client.save_record("plot:9", json!({"bad": true})).await;
    assert!(matches!(result, Err(SyncError::RejectedByServer(_))));
    assert_eq!(env.client.get_record("plot:9").unwrap(), Some(json!({"bad": true})));
}

#[tokio::test]
async fn test_offline_record_edits_replay_in_order() {
    let tmp = TempDir::new().unwrap();
    let env = create_test_env(&tmp, 0, false);

    env.client.save_record("plot:1", json!({"v": 1})).await.unwrap();
    env.client.save_record("plot:1", json!({"v": 2})).await.unwrap();
    env.client.remove_record("plot:1").await.unwrap();
    assert_eq!(env.client.get_record("plot:1").unwrap(), None);
    assert!(env.records.pushed.lock().is_empty());

    env.client.network().set_online(true);
    let report = env.client.sync_now().await.unwrap();
    assert_eq!(report.completed, 3);

    let pushed = env.records.pushed.lock().clone();
    let ops: Vec<_> = pushed.iter().map(|m| (m.op, m.value.clone())).collect();
    assert_eq!(
        ops,
        vec![
            (RecordOp::Upsert, Some(json!({"v": 1}))),
            (RecordOp::Upsert, Some(json!({"v": 2}))),
            (RecordOp::Delete, None),
        ]
    );
}

fn push_client(tmp: &TempDir) -> (OfflineClient, creditsync::PushPublisher) {
    let clock = ManualClock::new(1_000);
    let server = FakeLedger::new(0, clock.clone());
    let (publisher, source) = PushBalanceSource::channel(USER);
    let services = ClientServices::new(server)
        .with_push(source)
        .with_clock(Arc::new(clock))
        .initially_online(false);
    let client = OfflineClient::open(common::test_config(tmp.path()), services).unwrap();
    (client, publisher)
}

fn push(balance: i64, as_of: u64) -> AuthoritativeBalance {
    AuthoritativeBalance {
        user_id: USER.to_string(),
        balance,
        as_of,
        applied_transactions: vec![],
    }
}

#[tokio::test(start_paused = true)]
async fn test_pushed_balance_is_applied() {
    let tmp = TempDir::new().unwrap();
    let (client, publisher) = push_client(&tmp);
    client.start();

    client.request_credit(5, "refund").await.unwrap();
    assert!(publisher.publish(push(80, 2_000)));
    wait_until(|| client.ledger_snapshot().confirmed_balance == 80).await;
    // The queued credit still sits on top
    assert_eq!(client.visible_balance(), 85);

    // Older than what was applied: dropped by the publisher
    assert!(!publisher.publish(push(10, 1_500)));

    let mut with_applied = push(90, 3_000);
    let pending_tx = client
        .ledger_snapshot()
        .pending_deltas
        .keys()
        .next()
        .cloned()
        .unwrap();
    with_applied.applied_transactions = vec![pending_tx];
    assert!(publisher.publish(with_applied));
    wait_until(|| client.visible_balance() == 90).await;
    assert!(client.ledger_snapshot().pending_deltas.is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_balance_callback_sees_each_change() {
    let tmp = TempDir::new().unwrap();
    let env = create_test_env(&tmp, 20, false);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _listener = env.client.on_balance_changed(move |event| {
        sink.lock().push((event.visible_balance, event.cause));
    });
    tokio::task::yield_now().await;

    let tx = env.client.request_credit(7, "bonus").await.unwrap();
    env.client.network().set_online(true);
    env.client.sync_now().await.unwrap();

    wait_until(|| seen.lock().len() >= 3).await;
    let seen = seen.lock().clone();
    assert_eq!(seen[0], (7, BalanceChangeCause::Optimistic(tx.clone())));
    assert_eq!(seen[1], (7, BalanceChangeCause::Confirmed(tx)));
    assert_eq!(seen[2], (27, BalanceChangeCause::Authoritative));
}
