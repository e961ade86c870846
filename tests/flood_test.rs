use chrono::{DateTime, TimeZone, Utc};
use teloxide::types::{ChatId, UserId};
use watchdog_telegram_bot::flood_detector::FloodDetector;

const WINDOW: u64 = 60;
const MAX_EVENTS: usize = 5;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[test]
fn violation_fires_exactly_on_the_triggering_message() {
    let detector = FloodDetector::new(WINDOW, MAX_EVENTS, 3600);
    let (user, chat) = (UserId(1), ChatId(-100));

    for i in 0..MAX_EVENTS {
        assert!(
            !detector.record_and_check(user, chat, at(i as i64)),
            "message {} must not violate",
            i + 1
        );
    }
    assert!(
        detector.record_and_check(user, chat, at(MAX_EVENTS as i64)),
        "message max_events + 1 must violate"
    );
}

#[test]
fn waiting_past_the_window_resets_the_count() {
    let detector = FloodDetector::new(WINDOW, MAX_EVENTS, 3600);
    let (user, chat) = (UserId(1), ChatId(-100));

    for i in 0..=MAX_EVENTS {
        detector.record_and_check(user, chat, at(i as i64));
    }
    // Quiet period longer than the window; the next burst starts from zero.
    let later = WINDOW as i64 + 120;
    for i in 0..MAX_EVENTS {
        assert!(!detector.record_and_check(user, chat, at(later + i as i64)));
    }
    assert!(detector.record_and_check(user, chat, at(later + MAX_EVENTS as i64)));
}

#[test]
fn pairs_are_tracked_independently() {
    let detector = FloodDetector::new(WINDOW, MAX_EVENTS, 3600);

    for i in 0..=MAX_EVENTS {
        detector.record_and_check(UserId(1), ChatId(-100), at(i as i64));
    }
    // Same user in another chat, and another user in the same chat, are
    // both unaffected.
    assert!(!detector.record_and_check(UserId(1), ChatId(-200), at(10)));
    assert!(!detector.record_and_check(UserId(2), ChatId(-100), at(10)));
}

#[test]
fn out_of_order_timestamps_are_treated_as_the_same_instant() {
    let detector = FloodDetector::new(WINDOW, MAX_EVENTS, 3600);
    let (user, chat) = (UserId(1), ChatId(-100));

    detector.record_and_check(user, chat, at(30));
    // Clock skew: earlier timestamps arrive after a later one.
    assert!(!detector.record_and_check(user, chat, at(28)));
    assert!(!detector.record_and_check(user, chat, at(25)));
    // Counting still works and never goes negative.
    assert!(!detector.record_and_check(user, chat, at(31)));
    assert!(!detector.record_and_check(user, chat, at(32)));
    assert!(detector.record_and_check(user, chat, at(33)));
}

#[test]
fn idle_windows_are_reclaimed_by_the_sweep() {
    let detector = FloodDetector::new(WINDOW, MAX_EVENTS, 600);
    detector.record_and_check(UserId(1), ChatId(-100), at(0));
    detector.record_and_check(UserId(2), ChatId(-100), at(500));
    assert_eq!(detector.tracked_windows(), 2);

    let reclaimed = detector.sweep(at(700));
    assert_eq!(reclaimed, 1);
    assert_eq!(detector.tracked_windows(), 1);
}
