//! Centralized configuration: Redis keys, static defaults, and the engine
//! options read from the environment at startup.

use crate::error::{Result, WatchdogError};
use serde::{Deserialize, Serialize};
use std::env;

/// **Redis Key Prefixes:** identify categories of data stored in Redis.
pub mod key {
    /// Hash of global ban entries, field per user id (`"wd:gban"`).
    pub const GBAN_KEY: &str = "wd:gban";
    /// Set of global owner user ids (`"wd:owners"`).
    pub const OWNERS_KEY: &str = "wd:owners";
    /// Set of globally trusted user ids (`"wd:trusted"`).
    pub const GLOBAL_TRUSTED_KEY: &str = "wd:trusted";
    /// Hash of administered chats, field per chat id (`"wd:chats"`).
    pub const CHATS_KEY: &str = "wd:chats";
    /// Prefix for per-chat role hashes (e.g. `"wd:roles:<chat_id>"`).
    pub const ROLES_PREFIX: &str = "wd:roles:";
    /// Prefix for per-user reconciliation sets (e.g. `"wd:reconciled:<user_id>"`).
    pub const RECONCILED_PREFIX: &str = "wd:reconciled:";
    /// Hash of pending captcha snapshots, field per `<user>:<chat>` (`"wd:captcha"`).
    pub const CAPTCHA_KEY: &str = "wd:captcha";
    /// Prefix for processed-event markers (e.g. `"wd:event:<event_id>"`).
    pub const EVENT_PREFIX: &str = "wd:event:";
}

/// **Role Names:** string forms of roles as stored in Redis role hashes.
pub mod role_name {
    pub const ADMIN: &str = "admin";
    pub const TRUSTED: &str = "trusted";
    pub const MUTED: &str = "muted";
}

/// Seconds a processed-event marker is kept before expiry.
pub const EVENT_MARKER_TTL: u64 = 24 * 60 * 60;

/// Interval between captcha expiry sweeps, in seconds.
pub const CAPTCHA_SWEEP_INTERVAL: u64 = 30;

/// Interval between flood/duplicate window reclamation sweeps, in seconds.
pub const WINDOW_SWEEP_INTERVAL: u64 = 300;

/// Base delay for enforcement retry backoff, in milliseconds.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Default rule file consulted when `RULES_FILE` is not set.
pub const DEFAULT_RULES_FILE: &str = "rules.json";

/// The four score thresholds mapping a raw spam score to an action tier.
///
/// Thresholds must be positive and strictly ascending; a score at or above
/// `ban` recommends a ban, and so on down to `warn`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    pub warn: f64,
    pub delete: f64,
    pub mute: f64,
    pub ban: f64,
}

impl TierThresholds {
    fn validate(&self) -> Result<()> {
        if self.warn <= 0.0 {
            return Err(WatchdogError::Config(
                "spam_tier_thresholds.warn must be positive".into(),
            ));
        }
        if !(self.warn < self.delete && self.delete < self.mute && self.mute < self.ban) {
            return Err(WatchdogError::Config(format!(
                "spam tier thresholds must be strictly ascending, got \
                 warn={} delete={} mute={} ban={}",
                self.warn, self.delete, self.mute, self.ban
            )));
        }
        Ok(())
    }
}

/// Per-signal weights applied by the spam scorer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    /// Multiplier for the pattern-matcher severity total.
    pub pattern: f64,
    /// Contribution per effective link (plain, shortener, invite).
    pub link: f64,
    /// Contribution of an excessive-capitalization message.
    pub caps: f64,
    /// Contribution of a repeated-message hit.
    pub duplicate: f64,
    /// Contribution of a disposable phone/username hit.
    pub disposable: f64,
}

impl SignalWeights {
    fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("pattern", self.pattern),
            ("link", self.link),
            ("caps", self.caps),
            ("duplicate", self.duplicate),
            ("disposable", self.disposable),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(WatchdogError::Config(format!(
                    "signal weight '{}' must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        Ok(())
    }
}

/// Engine options read once at startup (and on explicit reload).
///
/// Every value has a default; a value that is *present but invalid* fails
/// startup instead of silently falling back.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub flood_window_seconds: u64,
    pub flood_max_events: usize,
    /// Idle flood windows older than this are reclaimed by the sweep.
    pub flood_idle_ttl_seconds: u64,
    pub tier_thresholds: TierThresholds,
    pub weights: SignalWeights,
    /// One of `text`, `math`, `button`, `voice`.
    pub captcha_kind: String,
    pub captcha_timeout_seconds: u64,
    pub captcha_max_retries: u32,
    /// Lookback window for the duplicate-message signal.
    pub duplicate_window_seconds: u64,
    /// Repeats of the same text within the lookback that trip the signal.
    pub duplicate_max_repeats: usize,
    /// Caps ratio above which the capitalization signal fires.
    pub caps_min_ratio: f64,
    /// Bounded attempt count for enforcement calls.
    pub enforcement_max_attempts: u32,
    /// Optional external disposable-number lookup endpoint.
    pub disposable_lookup_url: Option<String>,
    /// Whether a failed/timed-out lookup counts as clean (`true`) or dirty.
    pub disposable_fail_open: bool,
    /// Timeout for the disposable lookup call, in milliseconds.
    pub disposable_timeout_ms: u64,
    /// Whether a global Trusted role outranks a chat-local Muted role.
    pub trusted_overrides_mute: bool,
    pub rules_file: String,
    pub redis_url: String,
}

impl EngineConfig {
    /// Load the configuration from the environment, validating every value.
    pub fn from_env() -> Result<Self> {
        let cfg = EngineConfig {
            flood_window_seconds: env_u64("FLOOD_WINDOW_SECONDS", 60)?,
            flood_max_events: env_u64("FLOOD_MAX_EVENTS", 5)? as usize,
            flood_idle_ttl_seconds: env_u64("FLOOD_IDLE_TTL_SECONDS", 3600)?,
            tier_thresholds: TierThresholds {
                warn: env_f64("SPAM_THRESHOLD_WARN", 3.0)?,
                delete: env_f64("SPAM_THRESHOLD_DELETE", 6.0)?,
                mute: env_f64("SPAM_THRESHOLD_MUTE", 9.0)?,
                ban: env_f64("SPAM_THRESHOLD_BAN", 14.0)?,
            },
            weights: SignalWeights {
                pattern: env_f64("WEIGHT_PATTERN", 1.0)?,
                link: env_f64("WEIGHT_LINK", 2.0)?,
                caps: env_f64("WEIGHT_CAPS", 1.5)?,
                duplicate: env_f64("WEIGHT_DUPLICATE", 2.0)?,
                disposable: env_f64("WEIGHT_DISPOSABLE", 3.0)?,
            },
            captcha_kind: env_string("CAPTCHA_KIND", "button"),
            captcha_timeout_seconds: env_u64("CAPTCHA_TIMEOUT_SECONDS", 300)?,
            captcha_max_retries: env_u64("CAPTCHA_MAX_RETRIES", 3)? as u32,
            duplicate_window_seconds: env_u64("DUPLICATE_WINDOW_SECONDS", 600)?,
            duplicate_max_repeats: env_u64("DUPLICATE_MAX_REPEATS", 3)? as usize,
            caps_min_ratio: env_f64("CAPS_MIN_RATIO", 0.7)?,
            enforcement_max_attempts: env_u64("ENFORCEMENT_MAX_ATTEMPTS", 5)? as u32,
            disposable_lookup_url: env::var("DISPOSABLE_LOOKUP_URL").ok(),
            disposable_fail_open: env_bool("DISPOSABLE_FAIL_OPEN", true)?,
            disposable_timeout_ms: env_u64("DISPOSABLE_TIMEOUT_MS", 1500)?,
            trusted_overrides_mute: env_bool("TRUSTED_OVERRIDES_MUTE", false)?,
            rules_file: env_string("RULES_FILE", DEFAULT_RULES_FILE),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1/"),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flood_window_seconds == 0 {
            return Err(WatchdogError::Config(
                "flood_window_seconds must be positive".into(),
            ));
        }
        if self.flood_max_events == 0 {
            return Err(WatchdogError::Config(
                "flood_max_events must be positive".into(),
            ));
        }
        if self.captcha_timeout_seconds == 0 {
            return Err(WatchdogError::Config(
                "captcha_timeout_seconds must be positive".into(),
            ));
        }
        if !matches!(
            self.captcha_kind.as_str(),
            "text" | "math" | "button" | "voice"
        ) {
            return Err(WatchdogError::Config(format!(
                "captcha_kind must be one of text/math/button/voice, got '{}'",
                self.captcha_kind
            )));
        }
        if !(0.0..=1.0).contains(&self.caps_min_ratio) {
            return Err(WatchdogError::Config(format!(
                "caps_min_ratio must be within 0..=1, got {}",
                self.caps_min_ratio
            )));
        }
        if self.enforcement_max_attempts == 0 {
            return Err(WatchdogError::Config(
                "enforcement_max_attempts must be positive".into(),
            ));
        }
        self.tier_thresholds.validate()?;
        self.weights.validate()?;
        Ok(())
    }
}

impl Default for EngineConfig {
    /// Defaults used when no environment overrides are present.
    fn default() -> Self {
        EngineConfig {
            flood_window_seconds: 60,
            flood_max_events: 5,
            flood_idle_ttl_seconds: 3600,
            tier_thresholds: TierThresholds {
                warn: 3.0,
                delete: 6.0,
                mute: 9.0,
                ban: 14.0,
            },
            weights: SignalWeights {
                pattern: 1.0,
                link: 2.0,
                caps: 1.5,
                duplicate: 2.0,
                disposable: 3.0,
            },
            captcha_kind: "button".to_string(),
            captcha_timeout_seconds: 300,
            captcha_max_retries: 3,
            duplicate_window_seconds: 600,
            duplicate_max_repeats: 3,
            caps_min_ratio: 0.7,
            enforcement_max_attempts: 5,
            disposable_lookup_url: None,
            disposable_fail_open: true,
            disposable_timeout_ms: 1500,
            trusted_overrides_mute: false,
            rules_file: DEFAULT_RULES_FILE.to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
            WatchdogError::Config(format!("{} must be an unsigned integer, got '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<f64>().map_err(|_| {
            WatchdogError::Config(format!("{} must be a number, got '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(WatchdogError::Config(format!(
                "{} must be a boolean, got '{}'",
                name, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}
