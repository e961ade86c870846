//! teloxide dispatcher wiring: messages, membership service messages, admin
//! commands, and captcha button callbacks.

use crate::admin_handlers::{handle_admin_command, AdminCommand};
use crate::captcha::VerifyOutcome;
use crate::handlers::{handle_member, handle_message, AppContext};
use chrono::Utc;
use std::sync::Arc;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::dptree;
use teloxide::payloads::AnswerCallbackQuerySetters;
use teloxide::prelude::{CallbackQuery, Message, Requester, ResponseResult, Update};
use teloxide::utils::command::BotCommands;
use teloxide::Bot;

/// Dispatch one incoming message. Processing failures are logged and never
/// block subsequent updates.
pub async fn message_handler(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> ResponseResult<()> {
    if let Some(users) = msg.new_chat_members() {
        for user in users {
            if let Err(err) =
                handle_member::handle_new_member(ctx.clone(), bot.clone(), msg.chat.id, user).await
            {
                log::error!("new-member handling failed for {}: {}", user.id, err);
            }
        }
        return Ok(());
    }

    if let Some(user) = msg.left_chat_member() {
        if let Err(err) = handle_member::handle_member_left(ctx.clone(), msg.chat.id, user).await {
            log::error!("left-member handling failed for {}: {}", user.id, err);
        }
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if let Ok(cmd) = AdminCommand::parse(text, "WatchdogBot") {
            if let Err(err) = handle_admin_command(bot, ctx, msg.clone(), cmd).await {
                log::error!("admin command failed: {}", err);
            }
            return Ok(());
        }
        if let Err(err) = handle_message::handle_message(ctx, msg).await {
            log::error!("message processing failed: {}", err);
        }
    }
    Ok(())
}

/// Button captcha answers arrive as callback queries with `captcha:<token>`
/// payloads.
pub async fn callback_handler(
    bot: Bot,
    query: CallbackQuery,
    ctx: Arc<AppContext>,
) -> ResponseResult<()> {
    let data = match &query.data {
        Some(data) if data.starts_with("captcha:") => data.clone(),
        _ => return Ok(()),
    };
    let answer = data.trim_start_matches("captcha:");
    let chat_id = match &query.message {
        Some(message) => message.chat().id,
        None => return Ok(()),
    };
    let user_id = query.from.id;

    let outcome = ctx.captcha.verify(user_id, chat_id, answer, Utc::now()).await;
    match outcome {
        Ok(VerifyOutcome::Verified) => {
            if let Err(err) = ctx.sink.lift_restriction(chat_id, user_id).await {
                log::error!("lifting restriction for {} failed: {}", user_id, err);
            }
            bot.answer_callback_query(query.id)
                .text("Verification successful!")
                .await?;
        }
        Ok(VerifyOutcome::Retry { remaining }) => {
            bot.answer_callback_query(query.id)
                .text(format!("Incorrect, {} attempts remaining", remaining))
                .await?;
        }
        Ok(VerifyOutcome::Failed) => {
            if let Err(err) = ctx
                .sink
                .remove_user(chat_id, user_id, "failed verification")
                .await
            {
                log::error!("removing {} after failed captcha: {}", user_id, err);
            }
            bot.answer_callback_query(query.id)
                .text("Verification failed")
                .await?;
        }
        Ok(VerifyOutcome::Expired) | Ok(VerifyOutcome::NoChallenge) => {
            bot.answer_callback_query(query.id).await?;
        }
        Err(err) => {
            log::error!("captcha verification errored for {}: {}", user_id, err);
        }
    }
    Ok(())
}

/// Combines message and callback handlers into one dispatcher.
pub async fn run_dispatcher(bot: Bot, ctx: Arc<AppContext>) {
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(message_handler))
        .branch(Update::filter_callback_query().endpoint(callback_handler));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx])
        .build()
        .dispatch()
        .await;
}
