//! Admin command handling, gated on resolved roles.

use crate::admin_handlers::AdminCommand;
use crate::error::Result;
use crate::handlers::AppContext;
use crate::pattern_matcher::RuleFile;
use crate::roles::{ChatRole, Role};
use crate::storage::ChatRecord;
use chrono::Utc;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::UserId;
use teloxide::utils::command::BotCommands;

fn parse_user_id(raw: &str) -> Option<UserId> {
    raw.trim().parse::<u64>().ok().map(UserId)
}

pub async fn handle_admin_command(
    bot: Bot,
    ctx: Arc<AppContext>,
    msg: Message,
    cmd: AdminCommand,
) -> Result<()> {
    let issuer = match &msg.from {
        Some(user) => user.id,
        None => return Ok(()),
    };
    let chat_id = msg.chat.id;
    let role = ctx.resolver.resolve(issuer, chat_id).await?;

    let reply = match cmd {
        AdminCommand::Help => AdminCommand::descriptions().to_string(),
        AdminCommand::Gban { args } => {
            if role != Role::Owner {
                "Only an owner can issue global bans.".to_string()
            } else {
                let mut parts = args.splitn(2, char::is_whitespace);
                match parse_user_id(parts.next().unwrap_or_default()) {
                    Some(target) => {
                        let reason = parts.next().unwrap_or("no reason given").trim();
                        if ctx.gban.ban(target, reason, issuer, Utc::now()).await? {
                            format!("User {} globally banned: {}", target, reason)
                        } else {
                            format!("User {} is already globally banned.", target)
                        }
                    }
                    None => "Usage: /gban <user_id> <reason>".to_string(),
                }
            }
        }
        AdminCommand::Ungban { user } => {
            if role != Role::Owner {
                "Only an owner can lift global bans.".to_string()
            } else {
                match parse_user_id(&user) {
                    Some(target) => {
                        if ctx.gban.unban(target).await? {
                            format!("Global ban lifted for user {}.", target)
                        } else {
                            format!("User {} has no global ban.", target)
                        }
                    }
                    None => "Usage: /ungban <user_id>".to_string(),
                }
            }
        }
        AdminCommand::Role { args } => {
            if !matches!(role, Role::Owner | Role::Admin) {
                "Only an admin can assign roles.".to_string()
            } else {
                const USAGE: &str =
                    "Usage: /role <user_id> <admin|trusted|muted|gtrust|ungtrust|clear>";
                let mut parts = args.split_whitespace();
                let target = parse_user_id(parts.next().unwrap_or_default());
                let role_name = parts.next().unwrap_or_default();
                match (target, role_name) {
                    (Some(target), "clear") => {
                        ctx.store.set_chat_role(chat_id, target, None).await?;
                        format!("Role cleared for user {}.", target)
                    }
                    // Global trust crosses chat boundaries; owners only.
                    (Some(target), "gtrust") if role == Role::Owner => {
                        ctx.store.add_global_trusted(target).await?;
                        format!("User {} is now globally trusted.", target)
                    }
                    (Some(target), "ungtrust") if role == Role::Owner => {
                        ctx.store.remove_global_trusted(target).await?;
                        format!("User {} is no longer globally trusted.", target)
                    }
                    (Some(_), "gtrust") | (Some(_), "ungtrust") => {
                        "Only an owner can manage global trust.".to_string()
                    }
                    (Some(target), name) => match ChatRole::from_str(name) {
                        Some(chat_role) => {
                            ctx.store
                                .set_chat_role(chat_id, target, Some(chat_role))
                                .await?;
                            format!("User {} is now {} here.", target, chat_role.as_str())
                        }
                        None => USAGE.to_string(),
                    },
                    (None, _) => USAGE.to_string(),
                }
            }
        }
        AdminCommand::ReloadRules => {
            if !matches!(role, Role::Owner | Role::Admin) {
                "Only an admin can reload rules.".to_string()
            } else {
                match RuleFile::load(&ctx.config.rules_file)
                    .and_then(|file| ctx.matcher.reload(&file))
                {
                    Ok(report) => format!(
                        "Reloaded {} rules ({} skipped).",
                        report.loaded,
                        report.skipped.len()
                    ),
                    Err(err) => format!("Reload failed: {}", err),
                }
            }
        }
        AdminCommand::GbanStats => {
            let entries = ctx.gban.entries().await?;
            format!("{} active global bans.", entries.len())
        }
        AdminCommand::GbanSubscribe => {
            if !matches!(role, Role::Owner | Role::Admin) {
                "Only an admin can manage subscriptions.".to_string()
            } else {
                ctx.store
                    .upsert_chat(&ChatRecord {
                        chat_id,
                        title: msg.chat.title().unwrap_or_default().to_string(),
                        gban_subscribed: true,
                    })
                    .await?;
                "This chat now enforces global bans.".to_string()
            }
        }
        AdminCommand::ForgetChat => {
            if !matches!(role, Role::Owner | Role::Admin) {
                "Only an admin can remove this chat.".to_string()
            } else {
                // Per-chat state is garbage-collected, not actively notified.
                ctx.store.remove_chat(chat_id).await?;
                ctx.flood.purge_chat(chat_id);
                ctx.scorer.purge_chat(chat_id);
                ctx.captcha.purge_chat(chat_id).await?;
                "Chat removed from administration.".to_string()
            }
        }
    };

    if let Err(err) = bot.send_message(chat_id, reply).await {
        log::warn!("admin reply failed: {}", err);
    }
    Ok(())
}
