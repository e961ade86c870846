use anyhow::Context;
use chrono::Utc;
use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;

use watchdog_telegram_bot::captcha::{CaptchaCoordinator, CaptchaKind};
use watchdog_telegram_bot::config::{
    EngineConfig, CAPTCHA_SWEEP_INTERVAL, WINDOW_SWEEP_INTERVAL,
};
use watchdog_telegram_bot::enforcement::{EnforcementSink, RetryingSink, TelegramSink};
use watchdog_telegram_bot::engine::DecisionEngine;
use watchdog_telegram_bot::flood_detector::FloodDetector;
use watchdog_telegram_bot::gban::GbanManager;
use watchdog_telegram_bot::handlers::{dispatcher, AppContext};
use watchdog_telegram_bot::pattern_matcher::{PatternMatcher, RuleFile};
use watchdog_telegram_bot::roles::RoleResolver;
use watchdog_telegram_bot::spam_scorer::{DisposableLookup, SpamScorer};
use watchdog_telegram_bot::storage::{RedisStore, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    dotenv().ok();
    log::info!("Starting the protection engine...");

    let config = EngineConfig::from_env().context("configuration rejected")?;
    let bot_token = env::var("BOT_TOKEN").context("BOT_TOKEN must be set in .env file")?;
    let bot = Bot::new(bot_token);

    let store: Arc<dyn StateStore> =
        Arc::new(RedisStore::new(&config.redis_url).context("cannot open state store")?);

    let rules = RuleFile::load(&config.rules_file)?;
    let matcher = Arc::new(PatternMatcher::load(&rules)?);

    let lookup = config.disposable_lookup_url.clone().map(|url| {
        DisposableLookup::new(url, config.disposable_timeout_ms, config.disposable_fail_open)
    });
    let scorer = Arc::new(SpamScorer::new(
        matcher.clone(),
        config.weights,
        config.tier_thresholds,
        config.caps_min_ratio,
        config.duplicate_window_seconds,
        config.duplicate_max_repeats,
        lookup,
    ));
    let flood = Arc::new(FloodDetector::new(
        config.flood_window_seconds,
        config.flood_max_events,
        config.flood_idle_ttl_seconds,
    ));
    let resolver = Arc::new(RoleResolver::new(
        store.clone(),
        config.trusted_overrides_mute,
    ));
    let engine = Arc::new(DecisionEngine::new(
        resolver.clone(),
        scorer.clone(),
        flood.clone(),
    ));

    let telegram: Arc<dyn EnforcementSink> = Arc::new(TelegramSink::new(bot.clone()));
    let sink: Arc<dyn EnforcementSink> = Arc::new(RetryingSink::new(
        telegram.clone(),
        config.enforcement_max_attempts,
    ));

    let (gban, jobs) = GbanManager::new(
        store.clone(),
        telegram.clone(),
        config.enforcement_max_attempts,
    );
    let _propagation_worker = gban.spawn_worker(jobs);
    gban.reconcile_all()
        .await
        .context("gban reconciliation failed at startup")?;

    let kind = CaptchaKind::from_str(&config.captcha_kind)
        .expect("captcha_kind already validated");
    let captcha = Arc::new(CaptchaCoordinator::new(
        store.clone(),
        kind,
        config.captcha_timeout_seconds,
        config.captcha_max_retries,
        None,
    ));
    let recovered = captcha.recover().await?;
    if recovered > 0 {
        log::info!("recovered {} pending captcha challenges", recovered);
    }

    // Expiry is found by a periodic sweep, never per-challenge timers.
    {
        let captcha = captcha.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(CAPTCHA_SWEEP_INTERVAL));
            loop {
                tick.tick().await;
                match captcha.sweep(Utc::now()).await {
                    Ok(expired) => {
                        for challenge in expired {
                            if let Err(err) = sink
                                .remove_user(
                                    challenge.chat_id,
                                    challenge.user_id,
                                    "verification timed out",
                                )
                                .await
                            {
                                log::error!(
                                    "removing expired member {} from chat {}: {}",
                                    challenge.user_id,
                                    challenge.chat_id,
                                    err
                                );
                            }
                        }
                    }
                    Err(err) => log::error!("captcha sweep failed: {}", err),
                }
            }
        });
    }

    // Reclaim idle flood windows and duplicate-tracking state.
    {
        let flood = flood.clone();
        let scorer = scorer.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(WINDOW_SWEEP_INTERVAL));
            loop {
                tick.tick().await;
                let now = Utc::now();
                let reclaimed = flood.sweep(now);
                scorer.sweep(now);
                if reclaimed > 0 {
                    log::debug!("reclaimed {} idle flood windows", reclaimed);
                }
            }
        });
    }

    let ctx = Arc::new(AppContext {
        config,
        store,
        matcher,
        resolver,
        scorer,
        flood,
        engine,
        captcha,
        gban,
        sink,
    });

    dispatcher::run_dispatcher(bot, ctx).await;
    Ok(())
}
