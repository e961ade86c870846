//! Captcha verification state machine for new members.
//!
//! A challenge is `Pending` until answered, failed out, or expired; all three
//! outcomes are terminal. Expiry is detected by a periodic sweep over the
//! pending set, never by per-challenge timers, so scheduler load stays
//! bounded under many simultaneous joins.

use crate::error::{Result, WatchdogError};
use crate::storage::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use teloxide::types::{ChatId, UserId};

const TEXT_WORDS: &[&str] = &[
    "GUARD", "SHIELD", "VERIFY", "SECURE", "PROTECT", "TRUST", "SAFETY", "DEFEND",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptchaKind {
    Text,
    Math,
    Button,
    Voice,
}

impl CaptchaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::Text => "text",
            CaptchaKind::Math => "math",
            CaptchaKind::Button => "button",
            CaptchaKind::Voice => "voice",
        }
    }

    pub fn from_str(s: &str) -> Option<CaptchaKind> {
        match s {
            "text" => Some(CaptchaKind::Text),
            "math" => Some(CaptchaKind::Math),
            "button" => Some(CaptchaKind::Button),
            "voice" => Some(CaptchaKind::Voice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeState {
    Pending,
    Verified,
    Failed,
    Expired,
}

/// One verification challenge for one (user, chat) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub kind: CaptchaKind,
    pub prompt: String,
    pub expected: String,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
}

/// External transcription collaborator for voice challenges. The coordinator
/// never inspects audio itself.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn matches(&self, expected: &str, sample: &[u8]) -> Result<bool>;
}

/// What happened to a submitted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    /// Wrong answer, retries remain.
    Retry { remaining: u32 },
    /// Wrong answer, retry budget spent. The member is removed per policy.
    Failed,
    /// Past `expires_at`; the sweep owns the terminal transition.
    Expired,
    NoChallenge,
}

/// Tracks pending challenges and drives their transitions.
///
/// The in-memory pending map is a cache over the store's snapshots;
/// [`CaptchaCoordinator::recover`] rebuilds it after a restart.
pub struct CaptchaCoordinator {
    store: Arc<dyn StateStore>,
    kind: CaptchaKind,
    timeout: Duration,
    max_retries: u32,
    transcriber: Option<Arc<dyn Transcriber>>,
    pending: Mutex<HashMap<(u64, i64), CaptchaChallenge>>,
}

impl CaptchaCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        kind: CaptchaKind,
        timeout_seconds: u64,
        max_retries: u32,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Self {
        CaptchaCoordinator {
            store,
            kind,
            timeout: Duration::seconds(timeout_seconds as i64),
            max_retries: max_retries.max(1),
            transcriber,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Create a challenge for a newly observed unverified member. At most one
    /// challenge is pending per (user, chat); a duplicate join observation
    /// returns the existing one.
    pub async fn challenge(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<CaptchaChallenge> {
        if let Some(existing) = self.get_pending(user_id, chat_id) {
            return Ok(existing);
        }

        let (prompt, expected) = generate(self.kind);
        let challenge = CaptchaChallenge {
            user_id,
            chat_id,
            kind: self.kind,
            prompt,
            expected,
            attempts: 0,
            issued_at: now,
            expires_at: now + self.timeout,
            state: ChallengeState::Pending,
        };
        self.store.put_captcha(&challenge).await?;
        self.pending
            .lock()
            .expect("captcha lock poisoned")
            .insert((user_id.0, chat_id.0), challenge.clone());
        log::info!(
            "issued {} captcha for user {} in chat {}",
            self.kind.as_str(),
            user_id,
            chat_id
        );
        Ok(challenge)
    }

    /// Check a text answer against the pending challenge.
    pub async fn verify(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome> {
        let correct = {
            let pending = self.pending.lock().expect("captcha lock poisoned");
            match pending.get(&(user_id.0, chat_id.0)) {
                Some(challenge) if now >= challenge.expires_at => {
                    return Ok(VerifyOutcome::Expired)
                }
                Some(challenge) => {
                    answer.trim().eq_ignore_ascii_case(challenge.expected.trim())
                }
                None => return Ok(VerifyOutcome::NoChallenge),
            }
        };
        self.settle_answer(user_id, chat_id, correct).await
    }

    /// Check a voice sample via the transcription collaborator.
    pub async fn verify_voice(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        sample: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome> {
        let expected = {
            let pending = self.pending.lock().expect("captcha lock poisoned");
            match pending.get(&(user_id.0, chat_id.0)) {
                Some(challenge) if now >= challenge.expires_at => {
                    return Ok(VerifyOutcome::Expired)
                }
                Some(challenge) => challenge.expected.clone(),
                None => return Ok(VerifyOutcome::NoChallenge),
            }
        };
        let transcriber = self.transcriber.as_ref().ok_or_else(|| {
            WatchdogError::Config("voice captcha requires a transcriber".into())
        })?;
        let correct = transcriber.matches(&expected, sample).await?;
        self.settle_answer(user_id, chat_id, correct).await
    }

    async fn settle_answer(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        correct: bool,
    ) -> Result<VerifyOutcome> {
        if correct {
            self.close(user_id, chat_id, ChallengeState::Verified).await?;
            return Ok(VerifyOutcome::Verified);
        }

        let (failed, remaining, snapshot) = {
            let mut pending = self.pending.lock().expect("captcha lock poisoned");
            let challenge = match pending.get_mut(&(user_id.0, chat_id.0)) {
                Some(c) => c,
                None => return Ok(VerifyOutcome::NoChallenge),
            };
            challenge.attempts += 1;
            let failed = challenge.attempts >= self.max_retries;
            let remaining = self.max_retries.saturating_sub(challenge.attempts);
            (failed, remaining, challenge.clone())
        };

        if failed {
            self.close(user_id, chat_id, ChallengeState::Failed).await?;
            Ok(VerifyOutcome::Failed)
        } else {
            self.store.put_captcha(&snapshot).await?;
            Ok(VerifyOutcome::Retry { remaining })
        }
    }

    async fn close(&self, user_id: UserId, chat_id: ChatId, state: ChallengeState) -> Result<()> {
        self.pending
            .lock()
            .expect("captcha lock poisoned")
            .remove(&(user_id.0, chat_id.0));
        self.store.remove_captcha(user_id, chat_id).await?;
        log::info!(
            "captcha for user {} in chat {} closed as {:?}",
            user_id,
            chat_id,
            state
        );
        Ok(())
    }

    /// Expire every pending challenge past its deadline and return them so
    /// the caller can remove the members per policy. This is the only place
    /// the `Expired` transition happens.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<CaptchaChallenge>> {
        let expired: Vec<CaptchaChallenge> = {
            let mut pending = self.pending.lock().expect("captcha lock poisoned");
            let keys: Vec<(u64, i64)> = pending
                .iter()
                .filter(|(_, c)| c.expires_at <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k))
                .map(|mut c| {
                    c.state = ChallengeState::Expired;
                    c
                })
                .collect()
        };
        for challenge in &expired {
            self.store
                .remove_captcha(challenge.user_id, challenge.chat_id)
                .await?;
        }
        if !expired.is_empty() {
            log::info!("captcha sweep expired {} challenges", expired.len());
        }
        Ok(expired)
    }

    /// Drop the pending challenge for a member who left. A rejoin gets a
    /// fresh challenge, never a resurrected one.
    pub async fn cancel(&self, user_id: UserId, chat_id: ChatId) -> Result<()> {
        let removed = self
            .pending
            .lock()
            .expect("captcha lock poisoned")
            .remove(&(user_id.0, chat_id.0));
        if removed.is_some() {
            self.store.remove_captcha(user_id, chat_id).await?;
        }
        Ok(())
    }

    /// Drop every pending challenge for a chat no longer administered.
    pub async fn purge_chat(&self, chat_id: ChatId) -> Result<()> {
        let removed: Vec<(u64, i64)> = {
            let mut pending = self.pending.lock().expect("captcha lock poisoned");
            let keys: Vec<(u64, i64)> = pending
                .keys()
                .filter(|(_, chat)| *chat == chat_id.0)
                .copied()
                .collect();
            for key in &keys {
                pending.remove(key);
            }
            keys
        };
        for (user, chat) in removed {
            self.store
                .remove_captcha(UserId(user), ChatId(chat))
                .await?;
        }
        Ok(())
    }

    pub fn has_pending(&self, user_id: UserId, chat_id: ChatId) -> bool {
        self.pending
            .lock()
            .expect("captcha lock poisoned")
            .contains_key(&(user_id.0, chat_id.0))
    }

    pub fn get_pending(&self, user_id: UserId, chat_id: ChatId) -> Option<CaptchaChallenge> {
        self.pending
            .lock()
            .expect("captcha lock poisoned")
            .get(&(user_id.0, chat_id.0))
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("captcha lock poisoned").len()
    }

    /// Rebuild the pending map from durable snapshots after a restart.
    ///
    /// Two snapshots for the same key violate the one-pending-per-key
    /// invariant; the newer entry is discarded and the anomaly logged.
    pub async fn recover(&self) -> Result<usize> {
        let snapshots = self.store.list_captchas().await?;
        let mut pending = self.pending.lock().expect("captcha lock poisoned");
        pending.clear();
        let mut loaded = 0;
        for challenge in snapshots {
            if challenge.state != ChallengeState::Pending {
                continue;
            }
            let key = (challenge.user_id.0, challenge.chat_id.0);
            if let Some(existing) = pending.get(&key) {
                let err = WatchdogError::StateCorruption(format!(
                    "two pending captchas for user {} in chat {}",
                    challenge.user_id, challenge.chat_id
                ));
                log::error!("{}; discarding the newer entry", err);
                if challenge.issued_at < existing.issued_at {
                    pending.insert(key, challenge);
                }
                continue;
            }
            pending.insert(key, challenge);
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Build a prompt and its expected answer for the given kind. The answer is
/// a deterministic function of the generated prompt.
fn generate(kind: CaptchaKind) -> (String, String) {
    let mut rng = rand::thread_rng();
    match kind {
        CaptchaKind::Text => {
            let word = *TEXT_WORDS.choose(&mut rng).expect("word list is non-empty");
            let mut letters: Vec<char> = word.chars().collect();
            letters.shuffle(&mut rng);
            let scrambled: String = letters.into_iter().collect();
            (
                format!("Unscramble this word: {}", scrambled),
                word.to_lowercase(),
            )
        }
        CaptchaKind::Math => {
            let (a, b, op) = match rng.gen_range(0..3) {
                0 => (rng.gen_range(1..=20), rng.gen_range(1..=20), '+'),
                1 => (rng.gen_range(10..=50), rng.gen_range(1..=10), '-'),
                _ => (rng.gen_range(1..=12), rng.gen_range(1..=12), '*'),
            };
            let result = match op {
                '+' => a + b,
                '-' => a - b,
                _ => a * b,
            };
            (format!("Solve: {} {} {} = ?", a, op, b), result.to_string())
        }
        CaptchaKind::Button => {
            let token = rng.gen_range(1000..=9999);
            (
                format!("Tap the button showing {}", token),
                token.to_string(),
            )
        }
        CaptchaKind::Voice => {
            let digits: String = (0..4).map(|_| rng.gen_range(0..=9).to_string()).collect();
            (
                format!("Send a voice message saying the digits {}", digits),
                digits,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            CaptchaKind::Text,
            CaptchaKind::Math,
            CaptchaKind::Button,
            CaptchaKind::Voice,
        ] {
            assert_eq!(CaptchaKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(CaptchaKind::from_str("emoji"), None);
    }

    #[test]
    fn generated_answers_match_their_prompts() {
        let (prompt, expected) = generate(CaptchaKind::Math);
        let parts: Vec<&str> = prompt
            .trim_start_matches("Solve: ")
            .trim_end_matches(" = ?")
            .split_whitespace()
            .collect();
        let a: i64 = parts[0].parse().unwrap();
        let b: i64 = parts[2].parse().unwrap();
        let result = match parts[1] {
            "+" => a + b,
            "-" => a - b,
            _ => a * b,
        };
        assert_eq!(expected, result.to_string());
    }

    #[test]
    fn text_answer_is_the_unscrambled_word() {
        let (prompt, expected) = generate(CaptchaKind::Text);
        let scrambled = prompt.trim_start_matches("Unscramble this word: ");
        let mut scrambled_sorted: Vec<char> = scrambled.to_lowercase().chars().collect();
        scrambled_sorted.sort_unstable();
        let mut expected_sorted: Vec<char> = expected.chars().collect();
        expected_sorted.sort_unstable();
        assert_eq!(scrambled_sorted, expected_sorted);
    }
}
