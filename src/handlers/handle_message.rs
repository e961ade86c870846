//! Per-message processing: captcha answer interception, decision, and
//! enforcement.

use crate::captcha::VerifyOutcome;
use crate::engine::{ActionKind, Event};
use crate::error::Result;
use crate::handlers::AppContext;
use crate::storage::ChatRecord;
use chrono::Utc;
use std::sync::Arc;
use teloxide::types::Message;

/// Handle one regular chat message. A failure here is logged by the
/// dispatcher and never blocks subsequent messages.
pub async fn handle_message(ctx: Arc<AppContext>, msg: Message) -> Result<()> {
    let user = match &msg.from {
        Some(user) => user.clone(),
        None => return Ok(()),
    };
    let text = match msg.text() {
        Some(text) => text.to_string(),
        None => return Ok(()),
    };
    let chat_id = msg.chat.id;

    register_chat(&ctx, &msg).await?;

    // A member with a pending captcha answers through chat; their messages
    // are verification attempts, not content to score.
    if ctx.captcha.has_pending(user.id, chat_id) {
        let outcome = ctx
            .captcha
            .verify(user.id, chat_id, &text, Utc::now())
            .await?;
        match outcome {
            VerifyOutcome::Verified => {
                ctx.sink.lift_restriction(chat_id, user.id).await?;
                ctx.sink
                    .notify(chat_id, "Verification passed, welcome!")
                    .await?;
            }
            VerifyOutcome::Retry { remaining } => {
                ctx.sink
                    .notify(
                        chat_id,
                        &format!("Incorrect answer, {} attempts remaining.", remaining),
                    )
                    .await?;
            }
            VerifyOutcome::Failed => {
                ctx.sink
                    .remove_user(chat_id, user.id, "failed verification")
                    .await?;
            }
            VerifyOutcome::Expired | VerifyOutcome::NoChallenge => {}
        }
        return Ok(());
    }

    let event = Event {
        event_id: format!("{}:{}", chat_id.0, msg.id.0),
        chat_id,
        user_id: user.id,
        timestamp: msg.date,
        text: Some(text),
        username: user.username.clone(),
        language_hint: user.language_code.clone(),
        message_id: Some(msg.id),
        membership: None,
    };

    let action = ctx.engine.decide(&event).await?;
    if action.kind == ActionKind::Allow {
        return Ok(());
    }

    // Irreversible actions are keyed by event id so a redelivered update
    // cannot ban twice.
    if matches!(action.kind, ActionKind::Ban | ActionKind::Remove)
        && !ctx.store.mark_event_processed(&event.event_id).await?
    {
        log::debug!("event {} already enforced, skipping", event.event_id);
        return Ok(());
    }

    log::info!(
        "enforcing {:?} against user {} in chat {} ({})",
        action.kind,
        action.target,
        action.chat,
        action.reason
    );
    ctx.sink.execute(&action).await?;
    Ok(())
}

/// Make sure the chat is in the registry; first sight subscribes it to
/// global-ban enforcement by default.
async fn register_chat(ctx: &AppContext, msg: &Message) -> Result<()> {
    if ctx.store.get_chat(msg.chat.id).await?.is_none() {
        ctx.store
            .upsert_chat(&ChatRecord {
                chat_id: msg.chat.id,
                title: msg.chat.title().unwrap_or_default().to_string(),
                gban_subscribed: true,
            })
            .await?;
    }
    Ok(())
}
