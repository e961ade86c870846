//! Sliding-window flood detection per (user, chat).
//!
//! Windows are sharded by key hash so only operations on the same key
//! contend. Entries older than the window are evicted lazily on every check;
//! idle windows are reclaimed by the periodic sweep, so memory stays bounded
//! under churn.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use teloxide::types::{ChatId, UserId};

const SHARD_COUNT: usize = 16;

struct Window {
    hits: VecDeque<i64>,
    last_seen: i64,
}

pub struct FloodDetector {
    window_seconds: i64,
    max_events: usize,
    idle_ttl_seconds: i64,
    shards: Vec<Mutex<HashMap<(u64, i64), Window>>>,
}

impl FloodDetector {
    pub fn new(window_seconds: u64, max_events: usize, idle_ttl_seconds: u64) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        FloodDetector {
            window_seconds: window_seconds as i64,
            max_events,
            idle_ttl_seconds: idle_ttl_seconds as i64,
            shards,
        }
    }

    fn shard(&self, user_id: UserId, chat_id: ChatId) -> &Mutex<HashMap<(u64, i64), Window>> {
        let mut hasher = DefaultHasher::new();
        (user_id.0, chat_id.0).hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Record one message and report whether the rate threshold is exceeded.
    ///
    /// The violation is instantaneous, not sticky: the caller decides the
    /// punitive action and its duration. Timestamps arriving out of order
    /// within small skew are clamped to the latest seen instant so counts
    /// never go negative.
    pub fn record_and_check(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let mut shard = self
            .shard(user_id, chat_id)
            .lock()
            .expect("flood shard lock poisoned");
        let window = shard.entry((user_id.0, chat_id.0)).or_insert(Window {
            hits: VecDeque::new(),
            last_seen: 0,
        });

        let mut now = timestamp.timestamp();
        if let Some(&latest) = window.hits.back() {
            if now < latest {
                now = latest;
            }
        }

        while let Some(&oldest) = window.hits.front() {
            if oldest <= now - self.window_seconds {
                window.hits.pop_front();
            } else {
                break;
            }
        }

        window.hits.push_back(now);
        window.last_seen = now;
        window.hits.len() > self.max_events
    }

    /// Reclaim windows with no activity for the idle TTL.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.timestamp() - self.idle_ttl_seconds;
        let mut reclaimed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("flood shard lock poisoned");
            let before = shard.len();
            shard.retain(|_, window| window.last_seen > cutoff);
            reclaimed += before - shard.len();
        }
        reclaimed
    }

    /// Drop every window belonging to a chat no longer administered.
    pub fn purge_chat(&self, chat_id: ChatId) {
        for shard in &self.shards {
            shard
                .lock()
                .expect("flood shard lock poisoned")
                .retain(|(_, chat), _| *chat != chat_id.0);
        }
    }

    pub fn tracked_windows(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("flood shard lock poisoned").len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn under_threshold_is_quiet() {
        let detector = FloodDetector::new(60, 5, 3600);
        for i in 0..5 {
            assert!(!detector.record_and_check(UserId(1), ChatId(10), at(i)));
        }
    }

    #[test]
    fn out_of_order_timestamps_do_not_panic() {
        let detector = FloodDetector::new(60, 5, 3600);
        detector.record_and_check(UserId(1), ChatId(10), at(30));
        // Arrives with slightly earlier clock; treated as the same instant.
        assert!(!detector.record_and_check(UserId(1), ChatId(10), at(29)));
    }

    #[test]
    fn purge_chat_drops_only_that_chat() {
        let detector = FloodDetector::new(60, 5, 3600);
        detector.record_and_check(UserId(1), ChatId(10), at(0));
        detector.record_and_check(UserId(1), ChatId(11), at(0));
        detector.purge_chat(ChatId(10));
        assert_eq!(detector.tracked_windows(), 1);
    }
}
