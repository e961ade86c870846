//! Durable state boundary.
//!
//! The engine keeps its authoritative records (global bans, roles, chat
//! registry, reconciliation marks, captcha snapshots) behind [`StateStore`].
//! In-memory component state is a cache that can be rebuilt from the store
//! after a restart. [`RedisStore`] is the production implementation;
//! [`MemoryStore`] backs tests and restart-recovery fixtures.

use crate::captcha::CaptchaChallenge;
use crate::config::{key, EVENT_MARKER_TTL};
use crate::error::Result;
use crate::gban::GbanEntry;
use crate::roles::ChatRole;
use async_trait::async_trait;
use redis::Commands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use teloxide::types::{ChatId, UserId};

/// One administered chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: ChatId,
    pub title: String,
    /// Whether this chat subscribes to global-ban enforcement.
    pub gban_subscribed: bool,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_gban(&self, entry: &GbanEntry) -> Result<()>;
    async fn get_gban(&self, user_id: UserId) -> Result<Option<GbanEntry>>;
    /// Returns whether an entry existed.
    async fn remove_gban(&self, user_id: UserId) -> Result<bool>;
    async fn list_gbans(&self) -> Result<Vec<GbanEntry>>;

    async fn add_owner(&self, user_id: UserId) -> Result<()>;
    async fn is_owner(&self, user_id: UserId) -> Result<bool>;
    async fn add_global_trusted(&self, user_id: UserId) -> Result<()>;
    async fn remove_global_trusted(&self, user_id: UserId) -> Result<()>;
    async fn is_global_trusted(&self, user_id: UserId) -> Result<bool>;

    /// `None` clears the assignment.
    async fn set_chat_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: Option<ChatRole>,
    ) -> Result<()>;
    async fn chat_role(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<ChatRole>>;

    async fn upsert_chat(&self, record: &ChatRecord) -> Result<()>;
    async fn get_chat(&self, chat_id: ChatId) -> Result<Option<ChatRecord>>;
    async fn remove_chat(&self, chat_id: ChatId) -> Result<()>;
    async fn list_chats(&self) -> Result<Vec<ChatRecord>>;

    async fn mark_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<()>;
    async fn is_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<bool>;
    async fn clear_reconciled(&self, user_id: UserId) -> Result<()>;

    async fn put_captcha(&self, challenge: &CaptchaChallenge) -> Result<()>;
    async fn remove_captcha(&self, user_id: UserId, chat_id: ChatId) -> Result<()>;
    async fn list_captchas(&self) -> Result<Vec<CaptchaChallenge>>;

    /// Marks an event id as processed; returns `true` the first time. Used to
    /// make irreversible actions idempotent under at-least-once delivery.
    async fn mark_event_processed(&self, event_id: &str) -> Result<bool>;
}

/// Redis-backed store using the key layout in [`crate::config::key`].
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(RedisStore { client })
    }

    fn conn(&self) -> Result<redis::Connection> {
        Ok(self.client.get_connection()?)
    }

    fn roles_key(chat_id: ChatId) -> String {
        format!("{}{}", key::ROLES_PREFIX, chat_id.0)
    }

    fn reconciled_key(user_id: UserId) -> String {
        format!("{}{}", key::RECONCILED_PREFIX, user_id.0)
    }

    fn captcha_field(user_id: UserId, chat_id: ChatId) -> String {
        format!("{}:{}", user_id.0, chat_id.0)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put_gban(&self, entry: &GbanEntry) -> Result<()> {
        let mut conn = self.conn()?;
        let payload = serde_json::to_string(entry)?;
        let _: () = conn.hset(key::GBAN_KEY, entry.user_id.0, payload)?;
        Ok(())
    }

    async fn get_gban(&self, user_id: UserId) -> Result<Option<GbanEntry>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(key::GBAN_KEY, user_id.0)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_gban(&self, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.hdel(key::GBAN_KEY, user_id.0)?;
        Ok(removed > 0)
    }

    async fn list_gbans(&self) -> Result<Vec<GbanEntry>> {
        let mut conn = self.conn()?;
        let raw: HashMap<String, String> = conn.hgetall(key::GBAN_KEY)?;
        let mut entries = Vec::with_capacity(raw.len());
        for payload in raw.values() {
            entries.push(serde_json::from_str(payload)?);
        }
        entries.sort_by_key(|e: &GbanEntry| e.user_id.0);
        Ok(entries)
    }

    async fn add_owner(&self, user_id: UserId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.sadd(key::OWNERS_KEY, user_id.0)?;
        Ok(())
    }

    async fn is_owner(&self, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(conn.sismember(key::OWNERS_KEY, user_id.0)?)
    }

    async fn add_global_trusted(&self, user_id: UserId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.sadd(key::GLOBAL_TRUSTED_KEY, user_id.0)?;
        Ok(())
    }

    async fn remove_global_trusted(&self, user_id: UserId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.srem(key::GLOBAL_TRUSTED_KEY, user_id.0)?;
        Ok(())
    }

    async fn is_global_trusted(&self, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(conn.sismember(key::GLOBAL_TRUSTED_KEY, user_id.0)?)
    }

    async fn set_chat_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: Option<ChatRole>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let chat_key = Self::roles_key(chat_id);
        match role {
            Some(role) => {
                let _: () = conn.hset(&chat_key, user_id.0, role.as_str())?;
            }
            None => {
                let _: () = conn.hdel(&chat_key, user_id.0)?;
            }
        }
        Ok(())
    }

    async fn chat_role(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<ChatRole>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(Self::roles_key(chat_id), user_id.0)?;
        Ok(raw.as_deref().and_then(ChatRole::from_str))
    }

    async fn upsert_chat(&self, record: &ChatRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let payload = serde_json::to_string(record)?;
        let _: () = conn.hset(key::CHATS_KEY, record.chat_id.0, payload)?;
        Ok(())
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<Option<ChatRecord>> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(key::CHATS_KEY, chat_id.0)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_chat(&self, chat_id: ChatId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.hdel(key::CHATS_KEY, chat_id.0)?;
        let _: () = conn.del(Self::roles_key(chat_id))?;
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<ChatRecord>> {
        let mut conn = self.conn()?;
        let raw: HashMap<String, String> = conn.hgetall(key::CHATS_KEY)?;
        let mut chats = Vec::with_capacity(raw.len());
        for payload in raw.values() {
            chats.push(serde_json::from_str(payload)?);
        }
        chats.sort_by_key(|c: &ChatRecord| c.chat_id.0);
        Ok(chats)
    }

    async fn mark_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.sadd(Self::reconciled_key(user_id), chat_id.0)?;
        Ok(())
    }

    async fn is_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(conn.sismember(Self::reconciled_key(user_id), chat_id.0)?)
    }

    async fn clear_reconciled(&self, user_id: UserId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.del(Self::reconciled_key(user_id))?;
        Ok(())
    }

    async fn put_captcha(&self, challenge: &CaptchaChallenge) -> Result<()> {
        let mut conn = self.conn()?;
        let payload = serde_json::to_string(challenge)?;
        let field = Self::captcha_field(challenge.user_id, challenge.chat_id);
        let _: () = conn.hset(key::CAPTCHA_KEY, field, payload)?;
        Ok(())
    }

    async fn remove_captcha(&self, user_id: UserId, chat_id: ChatId) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.hdel(key::CAPTCHA_KEY, Self::captcha_field(user_id, chat_id))?;
        Ok(())
    }

    async fn list_captchas(&self) -> Result<Vec<CaptchaChallenge>> {
        let mut conn = self.conn()?;
        let raw: HashMap<String, String> = conn.hgetall(key::CAPTCHA_KEY)?;
        let mut challenges = Vec::with_capacity(raw.len());
        for payload in raw.values() {
            challenges.push(serde_json::from_str(payload)?);
        }
        Ok(challenges)
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let marker = format!("{}{}", key::EVENT_PREFIX, event_id);
        let set: Option<String> = redis::cmd("SET")
            .arg(&marker)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(EVENT_MARKER_TTL)
            .query(&mut conn)?;
        Ok(set.is_some())
    }
}

#[derive(Default)]
struct MemoryInner {
    gbans: HashMap<u64, GbanEntry>,
    owners: HashSet<u64>,
    global_trusted: HashSet<u64>,
    chat_roles: HashMap<(i64, u64), ChatRole>,
    chats: HashMap<i64, ChatRecord>,
    reconciled: HashMap<u64, HashSet<i64>>,
    captchas: Vec<CaptchaChallenge>,
    events: HashSet<String>,
}

/// In-memory store with the same semantics as [`RedisStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Push a raw captcha snapshot without key deduplication. Lets recovery
    /// fixtures stage the duplicate-entry corruption the coordinator must
    /// detect and resolve.
    pub fn inject_captcha_snapshot(&self, challenge: CaptchaChallenge) {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .captchas
            .push(challenge);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_gban(&self, entry: &GbanEntry) -> Result<()> {
        self.lock().gbans.insert(entry.user_id.0, entry.clone());
        Ok(())
    }

    async fn get_gban(&self, user_id: UserId) -> Result<Option<GbanEntry>> {
        Ok(self.lock().gbans.get(&user_id.0).cloned())
    }

    async fn remove_gban(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lock().gbans.remove(&user_id.0).is_some())
    }

    async fn list_gbans(&self) -> Result<Vec<GbanEntry>> {
        let mut entries: Vec<GbanEntry> = self.lock().gbans.values().cloned().collect();
        entries.sort_by_key(|e| e.user_id.0);
        Ok(entries)
    }

    async fn add_owner(&self, user_id: UserId) -> Result<()> {
        self.lock().owners.insert(user_id.0);
        Ok(())
    }

    async fn is_owner(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lock().owners.contains(&user_id.0))
    }

    async fn add_global_trusted(&self, user_id: UserId) -> Result<()> {
        self.lock().global_trusted.insert(user_id.0);
        Ok(())
    }

    async fn remove_global_trusted(&self, user_id: UserId) -> Result<()> {
        self.lock().global_trusted.remove(&user_id.0);
        Ok(())
    }

    async fn is_global_trusted(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lock().global_trusted.contains(&user_id.0))
    }

    async fn set_chat_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: Option<ChatRole>,
    ) -> Result<()> {
        let mut inner = self.lock();
        match role {
            Some(role) => {
                inner.chat_roles.insert((chat_id.0, user_id.0), role);
            }
            None => {
                inner.chat_roles.remove(&(chat_id.0, user_id.0));
            }
        }
        Ok(())
    }

    async fn chat_role(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<ChatRole>> {
        Ok(self.lock().chat_roles.get(&(chat_id.0, user_id.0)).copied())
    }

    async fn upsert_chat(&self, record: &ChatRecord) -> Result<()> {
        self.lock().chats.insert(record.chat_id.0, record.clone());
        Ok(())
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<Option<ChatRecord>> {
        Ok(self.lock().chats.get(&chat_id.0).cloned())
    }

    async fn remove_chat(&self, chat_id: ChatId) -> Result<()> {
        let mut inner = self.lock();
        inner.chats.remove(&chat_id.0);
        inner.chat_roles.retain(|(c, _), _| *c != chat_id.0);
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<ChatRecord>> {
        let mut chats: Vec<ChatRecord> = self.lock().chats.values().cloned().collect();
        chats.sort_by_key(|c| c.chat_id.0);
        Ok(chats)
    }

    async fn mark_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<()> {
        self.lock()
            .reconciled
            .entry(user_id.0)
            .or_default()
            .insert(chat_id.0);
        Ok(())
    }

    async fn is_reconciled(&self, user_id: UserId, chat_id: ChatId) -> Result<bool> {
        Ok(self
            .lock()
            .reconciled
            .get(&user_id.0)
            .is_some_and(|chats| chats.contains(&chat_id.0)))
    }

    async fn clear_reconciled(&self, user_id: UserId) -> Result<()> {
        self.lock().reconciled.remove(&user_id.0);
        Ok(())
    }

    async fn put_captcha(&self, challenge: &CaptchaChallenge) -> Result<()> {
        let mut inner = self.lock();
        inner
            .captchas
            .retain(|c| !(c.user_id == challenge.user_id && c.chat_id == challenge.chat_id));
        inner.captchas.push(challenge.clone());
        Ok(())
    }

    async fn remove_captcha(&self, user_id: UserId, chat_id: ChatId) -> Result<()> {
        self.lock()
            .captchas
            .retain(|c| !(c.user_id == user_id && c.chat_id == chat_id));
        Ok(())
    }

    async fn list_captchas(&self) -> Result<Vec<CaptchaChallenge>> {
        Ok(self.lock().captchas.clone())
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self.lock().events.insert(event_id.to_string()))
    }
}
