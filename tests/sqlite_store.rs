#![cfg(feature = "store-sqlite")]

mod common;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::BlockHash;
use chain_watch::{
    CallbackResult, CallbackStore, ConfirmationWatch, Error, NewRule, RemoveReason, Rule,
    RuleStatus, RuleStore, SqliteStore, Watch, WatchStatus, WatchStorage, WatchToRemove,
};
use common::tx;
use serde_json::json;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tempfile::NamedTempFile;
use url::Url;
use uuid::Uuid;

// temp file for each run; kept alive by the returned handle
fn open() -> anyhow::Result<(Arc<SqliteStore>, NamedTempFile)> {
    let tmp = NamedTempFile::new()?;
    let store = SqliteStore::new(tmp.path())?;
    Ok((Arc::new(store), tmp))
}

async fn rule(store: &SqliteStore) -> anyhow::Result<Rule> {
    let cb = store
        .add_callback(IpAddr::from([127, 0, 0, 1]), Url::parse("http://zcoin.io")?)
        .await?;
    Ok(store
        .add_rule(NewRule {
            transaction_id: tx(1).compute_txid(),
            confirmations: 6,
            waiting_time: Duration::from_secs(600),
            success_result: json!({ "status": "confirmed" }),
            timeout_result: json!("timeout"),
            callback: cb.id,
        })
        .await?)
}

fn watch_for(rule: &Rule) -> ConfirmationWatch {
    let start = BlockHash::from_raw_hash(sha256d::Hash::all_zeros());
    Watch::new(rule.clone(), start, 42, rule.transaction_id)
}

#[tokio::test]
async fn watches_round_trip_with_their_rule() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    assert!(store.list(WatchStatus::Pending).await?.is_empty());

    let rule = rule(&store).await?;
    let w = watch_for(&rule);
    store.add(&[w.clone()]).await?;

    let listed = store.list(WatchStatus::Pending).await?;
    assert_eq!(listed.len(), 1);
    let got = &listed[0];
    assert_eq!(got.id, w.id);
    assert_eq!(got.start_block, w.start_block);
    assert_eq!(got.start_height, 42);
    assert_eq!(got.transaction_id, rule.transaction_id);
    assert_eq!(got.context.id, rule.id);
    assert_eq!(got.context.waiting_time, Duration::from_secs(600));
    assert_eq!(got.context.success_result, json!({ "status": "confirmed" }));
    assert!(store.list(WatchStatus::Success).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn add_is_all_or_nothing() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;
    let existing = watch_for(&rule);
    store.add(&[existing.clone()]).await?;

    let fresh = watch_for(&rule);
    let err = store.add(&[fresh.clone(), existing.clone()]).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateId(id) if id == existing.id));
    assert_eq!(store.list(WatchStatus::Pending).await?.len(), 1);

    // A watch whose rule was never stored has no context to persist.
    let mut orphan = watch_for(&rule);
    orphan.context.id = Uuid::new_v4();
    let err = store.add(&[orphan.clone()]).await.unwrap_err();
    assert!(matches!(err, Error::ContextMissing(id) if id == orphan.id));
    Ok(())
}

#[tokio::test]
async fn update_status_enforces_transitions() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;
    let w = watch_for(&rule);
    store.add(&[w.clone()]).await?;

    let err = store.update_status(Uuid::new_v4(), WatchStatus::Success).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "watch", .. }));

    let err = store.update_status(w.id, WatchStatus::Pending).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTarget(_)));
    assert_eq!(store.list(WatchStatus::Pending).await?.len(), 1);

    store.update_status(w.id, WatchStatus::Success).await?;
    assert_eq!(store.list(WatchStatus::Success).await?.len(), 1);

    // Terminal is final, whatever the target.
    for target in [WatchStatus::Pending, WatchStatus::Success, WatchStatus::Rejected] {
        let err = store.update_status(w.id, target).await.unwrap_err();
        assert!(err.is_transition_race(), "{target}");
    }
    assert_eq!(store.list(WatchStatus::Success).await?[0].id, w.id);
    assert!(store.list(WatchStatus::Rejected).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn racing_transitions_have_one_winner() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;

    for _ in 0..5 {
        let w = watch_for(&rule);
        let id = w.id;
        store.add(&[w]).await?;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let target = if i % 2 == 0 {
                WatchStatus::Success
            } else {
                WatchStatus::Rejected
            };
            tasks.push(tokio::spawn(async move { store.update_status(id, target).await }));
        }

        let mut wins = 0;
        for t in tasks {
            match t.await? {
                Ok(()) => wins += 1,
                Err(e) => assert!(e.is_transition_race(), "unexpected: {e}"),
            }
        }
        assert_eq!(wins, 1);
    }
    Ok(())
}

#[tokio::test]
async fn removal_keeps_rows_but_hides_retracted_watches() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;
    let done = watch_for(&rule);
    let reorged = watch_for(&rule);
    store.add(&[done.clone(), reorged.clone()]).await?;
    store.update_status(done.id, WatchStatus::Success).await?;

    store
        .remove(&[
            WatchToRemove::new(done.clone(), RemoveReason::Completed),
            WatchToRemove::new(reorged.clone(), RemoveReason::BlockRemoved),
        ])
        .await?;

    assert!(store.list(WatchStatus::Pending).await?.is_empty());
    let success = store.list(WatchStatus::Success).await?;
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].id, done.id);
    assert!(store.list(WatchStatus::Rejected).await?.is_empty());

    let ghost = watch_for(&rule);
    let err = store
        .remove(&[WatchToRemove::new(ghost, RemoveReason::Completed)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn rules_follow_the_same_transition_contract() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;
    assert_eq!(store.get_rule(rule.id).await?.map(|r| r.status), Some(RuleStatus::Pending));
    assert!(store.get_rule(Uuid::new_v4()).await?.is_none());

    store.update_rule_status(rule.id, RuleStatus::Timeout).await?;
    let err = store
        .update_rule_status(rule.id, RuleStatus::Success)
        .await
        .unwrap_err();
    assert!(err.is_transition_race());
    assert!(store.list_rules(RuleStatus::Pending).await?.is_empty());
    assert_eq!(store.list_rules(RuleStatus::Timeout).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn callbacks_register_and_complete_idempotently() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let url = Url::parse("http://zcoin.io")?;
    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    let cb = store.add_callback(IpAddr::from([127, 0, 0, 1]), url.clone()).await?;

    assert_ne!(cb.id, Uuid::nil());
    assert!(!cb.completed);
    assert!(cb.registered_time > before);

    store.set_completed(cb.id).await?;
    store.set_completed(cb.id).await?;
    let got = store.get_callback(cb.id).await?.expect("stored");
    assert!(got.completed);
    assert_eq!(got.url, url);
    assert_eq!(got.registered_ip, IpAddr::from([127, 0, 0, 1]));

    assert!(store.get_callback(Uuid::new_v4()).await?.is_none());
    let err = store.set_completed(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "callback", .. }));
    Ok(())
}

#[tokio::test]
async fn history_is_validated_and_numbered_from_one() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let cb = store
        .add_callback(IpAddr::from([127, 0, 0, 1]), Url::parse("http://zcoin.io")?)
        .await?;
    let result = CallbackResult::new(
        CallbackResult::STATUS_UPDATE,
        json!("txid:46bdfcc6c953ba3e9a12456e3bd75ff887c9ba50051b3c58113eebffa35d7df4"),
    );

    let err = store.add_history(cb.id, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { name: "result", .. }));

    let unknown = Uuid::new_v4();
    let err = store.add_history(unknown, Some(&result)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "callback", .. }));
    assert!(store.history(unknown).await?.is_empty());

    let first = store.add_history(cb.id, Some(&result)).await?;
    let second = store.add_history(cb.id, Some(&result)).await?;
    assert_eq!((first.sequence, second.sequence), (1, 2));

    let history = store.history(cb.id).await?;
    assert_eq!(history, vec![first, second]);
    assert_eq!(history[0].status, CallbackResult::STATUS_UPDATE);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&history[0].data)?,
        result.data
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_history_has_no_gaps() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let cb = store
        .add_callback(IpAddr::from([127, 0, 0, 1]), Url::parse("http://zcoin.io")?)
        .await?;
    let id = cb.id;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let r = CallbackResult::new(CallbackResult::STATUS_UPDATE, json!(i));
            store.add_history(id, Some(&r)).await
        }));
    }
    for t in tasks {
        t.await??;
    }

    let seqs: Vec<u64> = store.history(cb.id).await?.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (1..=16).collect::<Vec<u64>>());
    Ok(())
}

#[tokio::test]
async fn retired_watches_refuse_transitions() -> anyhow::Result<()> {
    let (store, _tmp) = open()?;
    let rule = rule(&store).await?;
    let reorged = watch_for(&rule);
    store.add(&[reorged.clone()]).await?;
    store
        .remove(&[WatchToRemove::new(reorged.clone(), RemoveReason::BlockRemoved)])
        .await?;

    for target in [WatchStatus::Success, WatchStatus::Rejected] {
        let err = store.update_status(reorged.id, target).await.unwrap_err();
        assert!(err.is_transition_race(), "{target}");
    }
    for status in [WatchStatus::Pending, WatchStatus::Success, WatchStatus::Rejected] {
        assert!(store.list(status).await?.is_empty(), "{status}");
    }
    Ok(())
}

#[tokio::test]
async fn corrupt_waiting_time_is_a_storage_error() -> anyhow::Result<()> {
    let (store, tmp) = open()?;
    let rule = rule(&store).await?;

    let conn = rusqlite::Connection::open(tmp.path())?;
    conn.execute(
        "UPDATE rules SET waiting_ms = -1 WHERE id = ?1",
        [rule.id.to_string()],
    )?;
    drop(conn);

    let err = store.get_rule(rule.id).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "{err}");
    Ok(())
}
