//! Membership events: challenge new members, enforce global bans on join,
//! and drop pending state for members who leave.

use crate::captcha::CaptchaKind;
use crate::error::Result;
use crate::handlers::AppContext;
use chrono::Utc;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, User};

/// A freshly joined member: check the global ban list first, then restrict
/// and challenge.
pub async fn handle_new_member(
    ctx: Arc<AppContext>,
    bot: Bot,
    chat_id: ChatId,
    user: &User,
) -> Result<()> {
    if user.is_bot {
        return Ok(());
    }

    if ctx.store.get_gban(user.id).await?.is_some() {
        log::info!(
            "globally banned user {} joined chat {}, removing",
            user.id,
            chat_id
        );
        ctx.sink
            .remove_user(chat_id, user.id, "globally banned")
            .await?;
        return Ok(());
    }

    ctx.sink.restrict_user(chat_id, user.id, None).await?;
    let challenge = ctx.captcha.challenge(user.id, chat_id, Utc::now()).await?;

    let greeting = format!(
        "Welcome! Verification is required before you can post.\n{}",
        challenge.prompt
    );
    if challenge.kind == CaptchaKind::Button {
        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            "I'm human",
            format!("captcha:{}", challenge.expected),
        )]]);
        bot.send_message(chat_id, greeting)
            .reply_markup(keyboard)
            .await
            .map_err(|e| crate::error::WatchdogError::TransientEnforcement(e.to_string()))?;
    } else {
        ctx.sink.notify(chat_id, &greeting).await?;
    }
    Ok(())
}

/// A member left; their pending challenge is dropped so a rejoin starts
/// fresh.
pub async fn handle_member_left(ctx: Arc<AppContext>, chat_id: ChatId, user: &User) -> Result<()> {
    ctx.captcha.cancel(user.id, chat_id).await
}
