//! Integration tests for downlink scheduling and delivery.

use chrono::{Duration as ChronoDuration, Utc};
use lora_router::config::ScheduleConfig;
use lora_router::gateway::schedule::Schedule;
use lora_router::ScheduleError;
use std::time::Duration;
use tokio::time::timeout;

fn schedule() -> Schedule<String> {
    Schedule::new(ScheduleConfig::default())
}

/// Tests that committed downlinks arrive in transmit order, not commit order.
#[tokio::test]
async fn test_delivery_in_time_order() {
    let s = schedule();
    s.sync(0);
    let (late, _) = s.get_option(150_000, 10_000);
    let (early, _) = s.get_option(80_000, 10_000);
    s.schedule(&late, "late".to_string()).unwrap();
    s.schedule(&early, "early".to_string()).unwrap();

    let mut downlinks = s.subscribe().unwrap();
    let first = timeout(Duration::from_secs(2), downlinks.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(2), downlinks.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some("early"));
    assert_eq!(second.as_deref(), Some("late"));
    assert!(s.is_empty());
    s.stop();
}

/// Tests that a held option expires unclaimed and cannot be committed afterwards.
#[tokio::test]
async fn test_unclaimed_option_expires() {
    let s = schedule();
    s.sync(0);
    let (id, _) = s.get_option(20_000, 10_000);
    let _downlinks = s.subscribe().unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(s.is_empty());
    assert_eq!(s.schedule(&id, "too late".to_string()), Err(ScheduleError::NotFound(id)));
    s.stop();
}

/// Tests that options far in the future are not delivered early.
#[tokio::test]
async fn test_future_option_waits() {
    let s = schedule();
    s.sync(0);
    let (id, _) = s.get_option(5_000_000, 10_000);
    s.schedule(&id, "later".to_string()).unwrap();

    let mut downlinks = s.subscribe().unwrap();
    assert!(timeout(Duration::from_millis(200), downlinks.recv()).await.is_err());
    assert_eq!(s.len(), 1);
    s.stop();
}

/// Tests subscriber exclusivity and that stop closes the stream.
#[tokio::test]
async fn test_single_subscriber_and_stop() {
    let s = schedule();
    let mut downlinks = s.subscribe().unwrap();
    assert_eq!(s.subscribe().err(), Some(ScheduleError::AlreadySubscribed));
    assert!(s.is_active());

    s.stop();
    s.stop();
    assert!(!s.is_active());
    let closed = timeout(Duration::from_secs(1), downlinks.recv()).await.unwrap();
    assert!(closed.is_none());

    // A stopped schedule accepts a new subscriber
    let _again = s.subscribe().unwrap();
    s.stop();
}

/// Tests that counter values behind the synced clock map to the next wrap.
#[test]
fn test_realtime_wraps_forward() {
    let s = schedule();
    let before = Utc::now();
    s.sync(u32::MAX - 50_000);
    let t = s.realtime(50_000);
    assert!(t >= before);
    assert!(t - before < ChronoDuration::milliseconds(200));

    s.sync(1_000_000);
    let wrapped = s.realtime(0);
    let expected = Utc::now() + ChronoDuration::microseconds((1i64 << 32) - 1_000_000);
    assert!((wrapped - expected).num_milliseconds().abs() < 100);
}

/// Tests that delivered and expired items both leave the queue.
#[tokio::test]
async fn test_queue_drains_after_delivery() {
    let s = schedule();
    s.sync(0);
    let (id, _) = s.get_option(60_000, 40_000);
    s.schedule(&id, "first".to_string()).unwrap();
    assert_eq!(s.get_option(70_000, 40_000).1, 10);

    let mut downlinks = s.subscribe().unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), downlinks.recv()).await.unwrap().as_deref(),
        Some("first")
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(s.is_empty());
    s.stop();
}
