use chrono::Utc;
use std::sync::Arc;
use teloxide::types::{ChatId, UserId};
use watchdog_telegram_bot::gban::GbanEntry;
use watchdog_telegram_bot::roles::{ChatRole, Role, RoleResolver};
use watchdog_telegram_bot::storage::{MemoryStore, StateStore};

const CHAT: ChatId = ChatId(-100);
const USER: UserId = UserId(42);

fn gban_entry(user_id: UserId) -> GbanEntry {
    GbanEntry {
        user_id,
        reason: "spam campaign".to_string(),
        issued_by: UserId(1),
        issued_at: Utc::now(),
    }
}

async fn resolver() -> (Arc<MemoryStore>, RoleResolver) {
    let store = Arc::new(MemoryStore::new());
    let resolver = RoleResolver::new(store.clone(), false);
    (store, resolver)
}

#[tokio::test]
async fn unknown_user_is_a_member() {
    let (_store, resolver) = resolver().await;
    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Member);
}

#[tokio::test]
async fn gban_overrides_chat_admin() {
    let (store, resolver) = resolver().await;
    store
        .set_chat_role(CHAT, USER, Some(ChatRole::Admin))
        .await
        .unwrap();
    store.put_gban(&gban_entry(USER)).await.unwrap();

    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Banned);
}

#[tokio::test]
async fn gban_overrides_global_owner() {
    let (store, resolver) = resolver().await;
    store.add_owner(USER).await.unwrap();
    store.put_gban(&gban_entry(USER)).await.unwrap();

    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Banned);
}

#[tokio::test]
async fn owner_outranks_chat_roles() {
    let (store, resolver) = resolver().await;
    store.add_owner(USER).await.unwrap();
    store
        .set_chat_role(CHAT, USER, Some(ChatRole::Muted))
        .await
        .unwrap();

    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Owner);
}

#[tokio::test]
async fn chat_roles_resolve_in_order() {
    let (store, resolver) = resolver().await;
    for (chat_role, expected) in [
        (ChatRole::Admin, Role::Admin),
        (ChatRole::Trusted, Role::Trusted),
        (ChatRole::Muted, Role::Muted),
    ] {
        store
            .set_chat_role(CHAT, USER, Some(chat_role))
            .await
            .unwrap();
        assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn chat_mute_beats_global_trusted_by_default() {
    let (store, resolver) = resolver().await;
    store.add_global_trusted(USER).await.unwrap();
    store
        .set_chat_role(CHAT, USER, Some(ChatRole::Muted))
        .await
        .unwrap();

    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Muted);
}

#[tokio::test]
async fn trusted_override_policy_flips_the_mute_outcome() {
    let store = Arc::new(MemoryStore::new());
    let resolver = RoleResolver::new(store.clone(), true);
    store.add_global_trusted(USER).await.unwrap();
    store
        .set_chat_role(CHAT, USER, Some(ChatRole::Muted))
        .await
        .unwrap();

    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Trusted);
}

#[tokio::test]
async fn resolution_reads_fresh_state() {
    let (store, resolver) = resolver().await;
    store
        .set_chat_role(CHAT, USER, Some(ChatRole::Admin))
        .await
        .unwrap();
    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Admin);

    // Role change is visible on the next resolution, no caching in between.
    store.set_chat_role(CHAT, USER, None).await.unwrap();
    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Member);
}

#[tokio::test]
async fn unban_restores_member_not_prior_roles() {
    let (store, resolver) = resolver().await;
    store.put_gban(&gban_entry(USER)).await.unwrap();
    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Banned);

    store.remove_gban(USER).await.unwrap();
    assert_eq!(resolver.resolve(USER, CHAT).await.unwrap(), Role::Member);
}
