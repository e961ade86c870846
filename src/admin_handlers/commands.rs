use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Moderation commands:")]
pub enum AdminCommand {
    #[command(description = "show help.")]
    Help,
    #[command(description = "globally ban a user: /gban <user_id> <reason>")]
    Gban { args: String },
    #[command(description = "lift a global ban: /ungban <user_id>")]
    Ungban { user: String },
    #[command(description = "assign a chat role: /role <user_id> <admin|trusted|muted|clear>")]
    Role { args: String },
    #[command(description = "reload the content rule file.")]
    ReloadRules,
    #[command(description = "show global ban statistics.")]
    GbanStats,
    #[command(description = "subscribe this chat to global ban enforcement.")]
    GbanSubscribe,
    #[command(description = "stop administering this chat and drop its state.")]
    ForgetChat,
}
