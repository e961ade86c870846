//! Per-event decision orchestration.
//!
//! The engine resolves the sender's role first: banned users are removed
//! outright and privileged roles bypass filtering entirely. Everyone else is
//! run through the spam scorer and the flood detector concurrently, and the
//! two verdicts merge into exactly one action.

use crate::error::Result;
use crate::flood_detector::FloodDetector;
use crate::roles::{Role, RoleResolver};
use crate::spam_scorer::{MessageContext, SpamScorer, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use teloxide::types::{ChatId, MessageId, UserId};

/// Inbound message or membership event, delivered at least once.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: String,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub text: Option<String>,
    pub username: Option<String>,
    pub language_hint: Option<String>,
    pub message_id: Option<MessageId>,
    pub membership: Option<MembershipChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined,
    Left,
}

/// Moderation actions, ordered by severity. The merge rule relies on this
/// ordering being total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    Allow,
    Warn,
    Delete,
    RestrictTemporary,
    Mute,
    Remove,
    Ban,
}

/// One moderation decision, forwarded to the enforcement sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub target: UserId,
    pub chat: ChatId,
    pub message_id: Option<MessageId>,
    pub reason: String,
}

/// Map a spam tier to its enforcement action.
fn tier_action(tier: Tier) -> ActionKind {
    match tier {
        Tier::None => ActionKind::Allow,
        Tier::Warn => ActionKind::Warn,
        Tier::Delete => ActionKind::Delete,
        Tier::Mute => ActionKind::Mute,
        Tier::Ban => ActionKind::Ban,
    }
}

pub struct DecisionEngine {
    resolver: Arc<RoleResolver>,
    scorer: Arc<SpamScorer>,
    flood: Arc<FloodDetector>,
}

impl DecisionEngine {
    pub fn new(
        resolver: Arc<RoleResolver>,
        scorer: Arc<SpamScorer>,
        flood: Arc<FloodDetector>,
    ) -> Self {
        DecisionEngine {
            resolver,
            scorer,
            flood,
        }
    }

    /// Decide the single action for one inbound event.
    pub async fn decide(&self, event: &Event) -> Result<Action> {
        let role = self
            .resolver
            .resolve(event.user_id, event.chat_id)
            .await?;

        match role {
            Role::Banned => {
                return Ok(self.action(event, ActionKind::Remove, "globally banned".to_string()))
            }
            role if role.is_privileged() => {
                return Ok(self.action(event, ActionKind::Allow, String::new()))
            }
            Role::Muted => {
                return Ok(self.action(
                    event,
                    ActionKind::Delete,
                    "message from muted member".to_string(),
                ))
            }
            _ => {}
        }

        let text = match &event.text {
            Some(text) if !text.is_empty() => text.clone(),
            _ => return Ok(self.action(event, ActionKind::Allow, String::new())),
        };

        let msg = MessageContext {
            user_id: event.user_id,
            chat_id: event.chat_id,
            text,
            username: event.username.clone(),
            timestamp: event.timestamp,
            language_hint: event.language_hint.clone(),
        };

        // Independent state; run both and join before merging.
        let (score, flooded) = tokio::join!(self.scorer.score(&msg), async {
            self.flood
                .record_and_check(event.user_id, event.chat_id, event.timestamp)
        });

        let spam_action = tier_action(score.tier);
        let flood_action = if flooded {
            ActionKind::RestrictTemporary
        } else {
            ActionKind::Allow
        };
        let kind = spam_action.max(flood_action);

        let mut reasons = Vec::new();
        if score.tier > Tier::None {
            reasons.push(format!(
                "spam ({:.1}): {}",
                score.raw_score,
                score
                    .categories
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if flooded {
            reasons.push("flood: message rate exceeded".to_string());
        }

        Ok(self.action(event, kind, reasons.join("; ")))
    }

    fn action(&self, event: &Event, kind: ActionKind, reason: String) -> Action {
        Action {
            kind,
            target: event.user_id,
            chat: event.chat_id,
            message_id: event.message_id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_ordering_is_total() {
        let ordered = [
            ActionKind::Allow,
            ActionKind::Warn,
            ActionKind::Delete,
            ActionKind::RestrictTemporary,
            ActionKind::Mute,
            ActionKind::Remove,
            ActionKind::Ban,
        ];
        for window in ordered.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn tier_maps_to_matching_action() {
        assert_eq!(tier_action(Tier::None), ActionKind::Allow);
        assert_eq!(tier_action(Tier::Warn), ActionKind::Warn);
        assert_eq!(tier_action(Tier::Delete), ActionKind::Delete);
        assert_eq!(tier_action(Tier::Mute), ActionKind::Mute);
        assert_eq!(tier_action(Tier::Ban), ActionKind::Ban);
    }

    #[test]
    fn merge_prefers_the_stronger_verdict() {
        // Flood alone restricts; a mute-tier spam verdict outranks it.
        assert_eq!(
            ActionKind::Mute.max(ActionKind::RestrictTemporary),
            ActionKind::Mute
        );
        assert_eq!(
            ActionKind::Delete.max(ActionKind::RestrictTemporary),
            ActionKind::RestrictTemporary
        );
        assert_eq!(
            ActionKind::Allow.max(ActionKind::RestrictTemporary),
            ActionKind::RestrictTemporary
        );
    }
}
