//! Role resolution: the effective permission tier of a user in a chat.

use crate::error::Result;
use crate::storage::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use teloxide::types::{ChatId, UserId};

/// Effective tier of a user in a chat, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Active global ban. Overrides every chat-local role.
    Banned,
    /// Global owner of the engine.
    Owner,
    Admin,
    Trusted,
    Member,
    Muted,
}

impl Role {
    /// Roles whose messages bypass filtering entirely.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin | Role::Trusted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Banned => "banned",
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Trusted => "trusted",
            Role::Member => "member",
            Role::Muted => "muted",
        }
    }
}

/// Chat-scoped role assignment as stored per chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    Admin,
    Trusted,
    Muted,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::Admin => crate::config::role_name::ADMIN,
            ChatRole::Trusted => crate::config::role_name::TRUSTED,
            ChatRole::Muted => crate::config::role_name::MUTED,
        }
    }

    pub fn from_str(s: &str) -> Option<ChatRole> {
        match s {
            crate::config::role_name::ADMIN => Some(ChatRole::Admin),
            crate::config::role_name::TRUSTED => Some(ChatRole::Trusted),
            crate::config::role_name::MUTED => Some(ChatRole::Muted),
            _ => None,
        }
    }
}

/// Computes effective roles as a pure read against current state.
///
/// Precedence: GBAN, then global owner, then the chat-local role, then global
/// trusted, then plain member. Callers needing freshness after a role change
/// re-resolve; nothing is cached here.
pub struct RoleResolver {
    store: Arc<dyn StateStore>,
    trusted_overrides_mute: bool,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn StateStore>, trusted_overrides_mute: bool) -> Self {
        RoleResolver {
            store,
            trusted_overrides_mute,
        }
    }

    pub async fn resolve(&self, user_id: UserId, chat_id: ChatId) -> Result<Role> {
        if self.store.get_gban(user_id).await?.is_some() {
            return Ok(Role::Banned);
        }
        if self.store.is_owner(user_id).await? {
            return Ok(Role::Owner);
        }
        let globally_trusted = self.store.is_global_trusted(user_id).await?;
        match self.store.chat_role(chat_id, user_id).await? {
            Some(ChatRole::Admin) => Ok(Role::Admin),
            Some(ChatRole::Trusted) => Ok(Role::Trusted),
            Some(ChatRole::Muted) => {
                // Policy knob: by default the more restrictive chat-local
                // mute wins over a global trusted mark.
                if globally_trusted && self.trusted_overrides_mute {
                    Ok(Role::Trusted)
                } else {
                    Ok(Role::Muted)
                }
            }
            None if globally_trusted => Ok(Role::Trusted),
            None => Ok(Role::Member),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_role_round_trips() {
        for role in [ChatRole::Admin, ChatRole::Trusted, ChatRole::Muted] {
            assert_eq!(ChatRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(ChatRole::from_str("owner"), None);
    }

    #[test]
    fn privileged_roles() {
        assert!(Role::Owner.is_privileged());
        assert!(Role::Admin.is_privileged());
        assert!(Role::Trusted.is_privileged());
        assert!(!Role::Member.is_privileged());
        assert!(!Role::Muted.is_privileged());
        assert!(!Role::Banned.is_privileged());
    }
}
