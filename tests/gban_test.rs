use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use teloxide::types::{ChatId, UserId};
use watchdog_telegram_bot::enforcement::RecordingSink;
use watchdog_telegram_bot::gban::GbanManager;
use watchdog_telegram_bot::storage::{ChatRecord, MemoryStore, StateStore};

const TARGET: UserId = UserId(666);
const ISSUER: UserId = UserId(1);

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

async fn store_with_chats(subscribed: &[i64], unsubscribed: &[i64]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for &chat in subscribed {
        store
            .upsert_chat(&ChatRecord {
                chat_id: ChatId(chat),
                title: format!("chat {}", chat),
                gban_subscribed: true,
            })
            .await
            .unwrap();
    }
    for &chat in unsubscribed {
        store
            .upsert_chat(&ChatRecord {
                chat_id: ChatId(chat),
                title: format!("chat {}", chat),
                gban_subscribed: false,
            })
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn ban_is_authoritative_immediately() {
    let store = store_with_chats(&[-1], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink, 1);

    assert!(manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap());
    // The entry is readable before any enforcement has run.
    assert!(manager.is_banned(TARGET).await.unwrap());
    assert_eq!(store.list_gbans().await.unwrap().len(), 1);
}

#[tokio::test]
async fn issuing_the_same_ban_twice_is_a_no_op() {
    let store = store_with_chats(&[-1, -2], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink, 1);

    assert!(manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap());
    assert!(!manager.ban(TARGET, "again", ISSUER, now()).await.unwrap());

    let entries = store.list_gbans().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "spam");
}

#[tokio::test]
async fn propagation_reaches_every_subscribed_chat() {
    let store = store_with_chats(&[-1, -2, -3], &[-4]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    let report = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(report.enforced, 3);
    assert_eq!(report.failed, 0);

    let mut removals = sink.removals();
    removals.sort_by_key(|(chat, _)| chat.0);
    assert_eq!(
        removals,
        vec![
            (ChatId(-3), TARGET),
            (ChatId(-2), TARGET),
            (ChatId(-1), TARGET)
        ]
    );

    for chat in [-1, -2, -3] {
        assert!(store.is_reconciled(TARGET, ChatId(chat)).await.unwrap());
    }
    // Unsubscribed chats receive nothing.
    assert!(!store.is_reconciled(TARGET, ChatId(-4)).await.unwrap());
}

#[tokio::test]
async fn replaying_propagation_produces_no_duplicate_actions() {
    let store = store_with_chats(&[-1, -2], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(sink.removals().len(), 2);

    // Second pass over the same stable ban list: everything is already
    // reconciled, nothing is re-issued.
    let replay = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(replay.enforced, 0);
    assert_eq!(replay.already_reconciled, 2);
    assert_eq!(sink.removals().len(), 2);
}

#[tokio::test]
async fn restart_recomputes_work_from_the_durable_ban_list() {
    let store = store_with_chats(&[-1, -2], &[]).await;
    let first_sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), first_sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    // One chat fails before the "crash"; the other is reconciled.
    first_sink.fail_next(1);
    let partial = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(partial.enforced, 1);
    assert_eq!(partial.failed, 1);

    // Simulate a restart: a fresh manager over the same durable store picks
    // up exactly the outstanding chat, nothing more.
    let second_sink = Arc::new(RecordingSink::new());
    let (restarted, _rx2) = GbanManager::new(store.clone(), second_sink.clone(), 1);
    let report = restarted.propagate_ban(TARGET).await.unwrap();
    assert_eq!(report.enforced, 1);
    assert_eq!(report.already_reconciled, 1);
    assert_eq!(second_sink.removals().len(), 1);

    // A further pass is fully reconciled.
    let settled = restarted.propagate_ban(TARGET).await.unwrap();
    assert_eq!(settled.enforced, 0);
    assert_eq!(settled.already_reconciled, 2);
}

#[tokio::test]
async fn transient_failures_leave_the_chat_unreconciled_for_the_next_pass() {
    let store = store_with_chats(&[-1], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    // One attempt only: the injected failure exhausts the budget.
    let (manager, _rx) = GbanManager::new(store.clone(), sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    sink.fail_next(1);
    let report = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(!store.is_reconciled(TARGET, ChatId(-1)).await.unwrap());

    // The next pass converges.
    let retry = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(retry.enforced, 1);
    assert!(store.is_reconciled(TARGET, ChatId(-1)).await.unwrap());
}

#[tokio::test]
async fn unban_removes_the_entry_and_lifts_across_chats() {
    let store = store_with_chats(&[-1, -2], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    manager.propagate_ban(TARGET).await.unwrap();

    assert!(manager.unban(TARGET).await.unwrap());
    assert!(!manager.is_banned(TARGET).await.unwrap());
    // Unban of an unknown user reports false.
    assert!(!manager.unban(UserId(12345)).await.unwrap());

    let report = manager.propagate_lift(TARGET).await.unwrap();
    assert_eq!(report.enforced, 2);
}

#[tokio::test]
async fn propagation_for_a_lifted_ban_does_nothing() {
    let store = store_with_chats(&[-1], &[]).await;
    let sink = Arc::new(RecordingSink::new());
    let (manager, _rx) = GbanManager::new(store.clone(), sink.clone(), 1);

    manager.ban(TARGET, "spam", ISSUER, now()).await.unwrap();
    manager.unban(TARGET).await.unwrap();

    // The enforcement job raced with the unban; it finds no entry and
    // issues nothing.
    let report = manager.propagate_ban(TARGET).await.unwrap();
    assert_eq!(report.enforced, 0);
    assert!(sink.removals().is_empty());
}
