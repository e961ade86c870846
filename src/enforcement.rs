//! Enforcement boundary: executing moderation decisions against the platform.
//!
//! [`TelegramSink`] talks to Telegram through teloxide; [`RetryingSink`] adds
//! bounded retries with exponential backoff and escalates to the audit log
//! once the attempt budget is spent. [`RecordingSink`] is the test double
//! used by the integration suite.

use crate::config::BACKOFF_BASE_MS;
use crate::engine::{Action, ActionKind};
use crate::error::{Result, WatchdogError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use teloxide::payloads::RestrictChatMemberSetters;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatPermissions, UserId};

#[async_trait]
pub trait EnforcementSink: Send + Sync {
    /// Execute one decision. `Allow` is a no-op.
    async fn execute(&self, action: &Action) -> Result<()>;
    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
    /// Kick the user from the chat. Removing an already-absent user is a
    /// no-op, not an error.
    async fn remove_user(&self, chat_id: ChatId, user_id: UserId, reason: &str) -> Result<()>;
    async fn lift_ban(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()>;
}

fn transient(err: teloxide::RequestError) -> WatchdogError {
    WatchdogError::TransientEnforcement(err.to_string())
}

/// Sink backed by the Telegram Bot API.
pub struct TelegramSink {
    bot: Bot,
    /// How long a `RestrictTemporary` lasts.
    restrict_duration: ChronoDuration,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        TelegramSink {
            bot,
            restrict_duration: ChronoDuration::hours(1),
        }
    }
}

#[async_trait]
impl EnforcementSink for TelegramSink {
    async fn execute(&self, action: &Action) -> Result<()> {
        match action.kind {
            ActionKind::Allow => Ok(()),
            ActionKind::Warn => {
                let text = format!("Warning: {}", action.reason);
                self.notify(action.chat, &text).await
            }
            ActionKind::Delete => {
                if let Some(message_id) = action.message_id {
                    self.bot
                        .delete_message(action.chat, message_id)
                        .await
                        .map_err(transient)?;
                }
                Ok(())
            }
            ActionKind::RestrictTemporary => {
                let until = Utc::now() + self.restrict_duration;
                self.restrict_user(action.chat, action.target, Some(until))
                    .await
            }
            ActionKind::Mute => self.restrict_user(action.chat, action.target, None).await,
            ActionKind::Remove => {
                self.remove_user(action.chat, action.target, &action.reason)
                    .await
            }
            ActionKind::Ban => {
                if let Some(message_id) = action.message_id {
                    // Best effort; the ban is the authoritative part.
                    let _ = self.bot.delete_message(action.chat, message_id).await;
                }
                self.bot
                    .ban_chat_member(action.chat, action.target)
                    .await
                    .map_err(transient)?;
                Ok(())
            }
        }
    }

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let request = self
            .bot
            .restrict_chat_member(chat_id, user_id, ChatPermissions::empty());
        match until {
            Some(until) => request.until_date(until).await.map_err(transient)?,
            None => request.await.map_err(transient)?,
        };
        Ok(())
    }

    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.bot
            .restrict_chat_member(chat_id, user_id, ChatPermissions::all())
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn remove_user(&self, chat_id: ChatId, user_id: UserId, _reason: &str) -> Result<()> {
        self.bot
            .ban_chat_member(chat_id, user_id)
            .await
            .map_err(transient)?;
        // Unban immediately so the removal is a kick, not a permanent ban.
        self.bot
            .unban_chat_member(chat_id, user_id)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn lift_ban(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.bot
            .unban_chat_member(chat_id, user_id)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.bot
            .send_message(chat_id, text)
            .await
            .map_err(transient)?;
        Ok(())
    }
}

/// Wraps a sink with bounded retries and exponential backoff. A call still
/// failing after the attempt budget is escalated to the audit log and
/// surfaced to the caller, never silently dropped.
pub struct RetryingSink {
    inner: Arc<dyn EnforcementSink>,
    max_attempts: u32,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn EnforcementSink>, max_attempts: u32) -> Self {
        RetryingSink {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn with_retry<F, Fut>(&self, what: &str, call: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut delay = Duration::from_millis(BACKOFF_BASE_MS);
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err @ WatchdogError::TransientEnforcement(_)) => {
                    log::warn!("{} attempt {}/{} failed: {}", what, attempt, self.max_attempts, err);
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        let err = last_err
            .unwrap_or_else(|| WatchdogError::TransientEnforcement(format!("{} failed", what)));
        log::error!(
            "escalation: {} still failing after {} attempts: {}",
            what,
            self.max_attempts,
            err
        );
        Err(err)
    }
}

#[async_trait]
impl EnforcementSink for RetryingSink {
    async fn execute(&self, action: &Action) -> Result<()> {
        self.with_retry("execute", || self.inner.execute(action)).await
    }

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_retry("restrict", || self.inner.restrict_user(chat_id, user_id, until))
            .await
    }

    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.with_retry("lift restriction", || {
            self.inner.lift_restriction(chat_id, user_id)
        })
        .await
    }

    async fn remove_user(&self, chat_id: ChatId, user_id: UserId, reason: &str) -> Result<()> {
        self.with_retry("remove", || self.inner.remove_user(chat_id, user_id, reason))
            .await
    }

    async fn lift_ban(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.with_retry("lift ban", || self.inner.lift_ban(chat_id, user_id))
            .await
    }

    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.with_retry("notify", || self.inner.notify(chat_id, text))
            .await
    }
}

/// One observed sink call, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Execute(Action),
    Restrict(ChatId, UserId),
    LiftRestriction(ChatId, UserId),
    Remove(ChatId, UserId),
    LiftBan(ChatId, UserId),
    Notify(ChatId, String),
}

/// Test double recording every call; can be told to fail the next N calls
/// with a transient error to exercise retry and backoff paths.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_remaining: Mutex<u32>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink::default()
    }

    pub fn fail_next(&self, count: u32) {
        *self.fail_remaining.lock().expect("sink lock poisoned") = count;
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().expect("sink lock poisoned").clone()
    }

    pub fn removals(&self) -> Vec<(ChatId, UserId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Remove(chat, user) => Some((chat, user)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SinkCall) -> Result<()> {
        let mut failing = self.fail_remaining.lock().expect("sink lock poisoned");
        if *failing > 0 {
            *failing -= 1;
            return Err(WatchdogError::TransientEnforcement(
                "injected failure".to_string(),
            ));
        }
        drop(failing);
        self.calls.lock().expect("sink lock poisoned").push(call);
        Ok(())
    }
}

#[async_trait]
impl EnforcementSink for RecordingSink {
    async fn execute(&self, action: &Action) -> Result<()> {
        self.record(SinkCall::Execute(action.clone()))
    }

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        _until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.record(SinkCall::Restrict(chat_id, user_id))
    }

    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.record(SinkCall::LiftRestriction(chat_id, user_id))
    }

    async fn remove_user(&self, chat_id: ChatId, user_id: UserId, _reason: &str) -> Result<()> {
        self.record(SinkCall::Remove(chat_id, user_id))
    }

    async fn lift_ban(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.record(SinkCall::LiftBan(chat_id, user_id))
    }

    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.record(SinkCall::Notify(chat_id, text.to_string()))
    }
}
