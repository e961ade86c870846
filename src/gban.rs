//! Global ban list and cross-chat enforcement propagation.
//!
//! A ban is authoritative the instant its entry is written to the store.
//! Enforcement across administered chats is asynchronous and eventually
//! consistent: one enforcement task per subscribed chat, retried with
//! backoff, with a reconciliation mark recorded per chat once confirmed.
//! After a restart the outstanding work set is recomputed from the durable
//! ban list, never from volatile state.

use crate::enforcement::{EnforcementSink, RetryingSink};
use crate::error::Result;
use crate::storage::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use teloxide::types::UserId;
use tokio::sync::mpsc;

/// One active global ban. Globally unique per user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbanEntry {
    pub user_id: UserId,
    pub reason: String,
    pub issued_by: UserId,
    pub issued_at: DateTime<Utc>,
}

/// Work items consumed by the propagation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationJob {
    Enforce(UserId),
    Lift(UserId),
}

/// Outcome of one propagation pass over the chat registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub enforced: usize,
    pub already_reconciled: usize,
    pub failed: usize,
}

pub struct GbanManager {
    store: Arc<dyn StateStore>,
    sink: RetryingSink,
    jobs: mpsc::UnboundedSender<PropagationJob>,
}

impl GbanManager {
    /// Build the manager and the job queue its worker drains. Callers spawn
    /// the worker with [`GbanManager::spawn_worker`]; tests may drive
    /// [`GbanManager::propagate_ban`] directly instead.
    pub fn new(
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EnforcementSink>,
        max_attempts: u32,
    ) -> (Arc<GbanManager>, mpsc::UnboundedReceiver<PropagationJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(GbanManager {
            store,
            sink: RetryingSink::new(sink, max_attempts),
            jobs,
        });
        (manager, rx)
    }

    /// Long-lived background worker, decoupled from message processing.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PropagationJob>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = match job {
                    PropagationJob::Enforce(user) => manager.propagate_ban(user).await,
                    PropagationJob::Lift(user) => manager.propagate_lift(user).await,
                };
                if let Err(err) = outcome {
                    log::error!("gban propagation job {:?} failed: {}", job, err);
                }
            }
        })
    }

    /// Write the authoritative ban entry and enqueue enforcement. Returns
    /// `false` if the user was already banned (idempotent re-issue).
    pub async fn ban(
        &self,
        user_id: UserId,
        reason: &str,
        issued_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.store.get_gban(user_id).await?.is_some() {
            return Ok(false);
        }
        let entry = GbanEntry {
            user_id,
            reason: reason.to_string(),
            issued_by,
            issued_at: now,
        };
        self.store.put_gban(&entry).await?;
        self.store.clear_reconciled(user_id).await?;
        log::info!("user {} globally banned by {}: {}", user_id, issued_by, reason);
        let _ = self.jobs.send(PropagationJob::Enforce(user_id));
        Ok(true)
    }

    /// Remove the ban entry and enqueue the lift. Prior per-chat roles are
    /// not restored. Returns `false` if no entry existed.
    pub async fn unban(&self, user_id: UserId) -> Result<bool> {
        if !self.store.remove_gban(user_id).await? {
            return Ok(false);
        }
        self.store.clear_reconciled(user_id).await?;
        log::info!("user {} globally unbanned", user_id);
        let _ = self.jobs.send(PropagationJob::Lift(user_id));
        Ok(true)
    }

    pub async fn is_banned(&self, user_id: UserId) -> Result<bool> {
        Ok(self.store.get_gban(user_id).await?.is_some())
    }

    pub async fn entries(&self) -> Result<Vec<GbanEntry>> {
        self.store.list_gbans().await
    }

    /// Enforce one ban across every subscribed chat not yet reconciled.
    ///
    /// Re-running this is safe: reconciled chats are skipped, and removing an
    /// already-removed user is a no-op at the sink. A chat still failing
    /// after the retry budget is left unreconciled for the next pass.
    pub async fn propagate_ban(&self, user_id: UserId) -> Result<PropagationReport> {
        let entry = match self.store.get_gban(user_id).await? {
            Some(entry) => entry,
            // Ban lifted while the job sat in the queue.
            None => return Ok(PropagationReport::default()),
        };

        let mut report = PropagationReport::default();
        for chat in self.store.list_chats().await? {
            if !chat.gban_subscribed {
                continue;
            }
            if self.store.is_reconciled(user_id, chat.chat_id).await? {
                report.already_reconciled += 1;
                continue;
            }
            match self
                .sink
                .remove_user(chat.chat_id, user_id, &entry.reason)
                .await
            {
                Ok(()) => {
                    self.store.mark_reconciled(user_id, chat.chat_id).await?;
                    report.enforced += 1;
                }
                Err(err) => {
                    log::warn!(
                        "gban enforcement for user {} in chat {} deferred: {}",
                        user_id,
                        chat.chat_id,
                        err
                    );
                    report.failed += 1;
                }
            }
        }
        log::info!(
            "gban propagation for user {}: {} enforced, {} reconciled, {} deferred",
            user_id,
            report.enforced,
            report.already_reconciled,
            report.failed
        );
        Ok(report)
    }

    /// Lift a ban across every subscribed chat.
    pub async fn propagate_lift(&self, user_id: UserId) -> Result<PropagationReport> {
        let mut report = PropagationReport::default();
        for chat in self.store.list_chats().await? {
            if !chat.gban_subscribed {
                continue;
            }
            match self.sink.lift_ban(chat.chat_id, user_id).await {
                Ok(()) => report.enforced += 1,
                Err(err) => {
                    log::warn!(
                        "gban lift for user {} in chat {} failed: {}",
                        user_id,
                        chat.chat_id,
                        err
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Recompute and enqueue the outstanding work set after a restart.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let entries = self.store.list_gbans().await?;
        let count = entries.len();
        for entry in entries {
            let _ = self.jobs.send(PropagationJob::Enforce(entry.user_id));
        }
        if count > 0 {
            log::info!("queued reconciliation for {} global bans", count);
        }
        Ok(count)
    }
}
