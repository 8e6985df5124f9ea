//! # Downlink Schedule
//!
//! Per-gateway reservation of downlink transmission slots. The schedule maps
//! the gateway's 32-bit microsecond counter onto wall-clock time, hands out
//! conflict-scored options, commits payloads to them and delivers committed
//! payloads to a single subscriber in transmit order.
//!
//! Item lifecycle: `get_option` creates a held item, `schedule` commits a
//! payload to it, and the delivery loop pops it once its transmit time is
//! within `deadline`. Popped items are delivered when committed and dropped
//! otherwise.
//!
//! ```rust,no_run
//! use lora_router::config::ScheduleConfig;
//! use lora_router::gateway::schedule::Schedule;
//!
//! # async fn run() {
//! let schedule: Schedule<Vec<u8>> = Schedule::new(ScheduleConfig::default());
//! schedule.sync(0);
//! let (id, conflicts) = schedule.get_option(1_000_000, 41_216);
//! assert_eq!(conflicts, 0);
//! schedule.schedule(&id, b"join-accept".to_vec()).unwrap();
//!
//! let mut downlinks = schedule.subscribe().unwrap();
//! assert_eq!(downlinks.recv().await.unwrap(), b"join-accept".to_vec());
//! schedule.stop();
//! # }
//! ```

use crate::config::ScheduleConfig;
use crate::constants::GATEWAY_TIMESTAMP_WRAP_US;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// Unknown id, or the item was already delivered or expired
    #[error("ID not found: {0}")]
    NotFound(String),

    #[error("Schedule already has an active subscriber")]
    AlreadySubscribed,
}

/// A downlink slot, held until a payload is committed
#[derive(Debug, Clone)]
pub struct ScheduledItem<T> {
    pub id: String,
    /// Wall-clock realization of `timestamp`
    pub time: DateTime<Utc>,
    /// Gateway counter value (µs, wraps at 2^32)
    pub timestamp: u32,
    /// Airtime in µs
    pub length: u32,
    /// Conflict score when the option was created
    pub score: u32,
    pub payload: Option<T>,
}

impl<T> ScheduledItem<T> {
    pub fn is_committed(&self) -> bool {
        self.payload.is_some()
    }

    /// Whether `[timestamp, timestamp + length)` overlaps this item's window modulo 2^32
    pub fn overlaps(&self, timestamp: u32, length: u32) -> bool {
        windows_overlap(self.timestamp, self.length, timestamp, length)
    }
}

/// Overlap of two half-open windows on the 32-bit counter circle
pub fn windows_overlap(a: u32, a_len: u32, b: u32, b_len: u32) -> bool {
    b.wrapping_sub(a) < a_len || a.wrapping_sub(b) < b_len
}

/// Items ordered ascending by realized time
#[derive(Debug)]
pub struct DownlinkQueue<T> {
    items: VecDeque<ScheduledItem<T>>,
}

impl<T> Default for DownlinkQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T> DownlinkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping time order; equal times keep insertion order
    pub fn push(&mut self, item: ScheduledItem<T>) {
        let at = self.items.partition_point(|existing| existing.time <= item.time);
        self.items.insert(at, item);
    }

    pub fn peek(&self) -> Option<&ScheduledItem<T>> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<ScheduledItem<T>> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledItem<T>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove the item `id` realized at `time`
    fn remove(&mut self, id: &str, time: DateTime<Utc>) -> Option<ScheduledItem<T>> {
        let start = self.items.partition_point(|item| item.time < time);
        let offset = self
            .items
            .range(start..)
            .take_while(|item| item.time == time)
            .position(|item| item.id == id)?;
        self.items.remove(start + offset)
    }

    /// The item `id` realized at `time`
    fn find_mut(&mut self, id: &str, time: DateTime<Utc>) -> Option<&mut ScheduledItem<T>> {
        let start = self.items.partition_point(|item| item.time < time);
        self.items
            .range_mut(start..)
            .take_while(|item| item.time == time)
            .find(|item| item.id == id)
    }
}

#[derive(Debug)]
struct ScheduleState<T> {
    /// Wall-clock time of gateway counter value 0
    offset: DateTime<Utc>,
    queue: DownlinkQueue<T>,
    by_id: HashMap<String, DateTime<Utc>>,
}

impl<T> ScheduleState<T> {
    fn realtime(&self, timestamp: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let t = self.offset + ChronoDuration::microseconds(i64::from(timestamp));
        if t >= now {
            return t;
        }
        // Next occurrence of this counter value
        let wrap = GATEWAY_TIMESTAMP_WRAP_US as i64;
        let behind = (now - t).num_microseconds().unwrap_or(i64::MAX);
        let wraps = behind / wrap + 1;
        t + ChronoDuration::microseconds(wraps.saturating_mul(wrap))
    }

    /// Pop everything due before `horizon` and unindex it
    ///
    /// Returns the committed items; held items are dropped as expired.
    fn take_due(&mut self, horizon: DateTime<Utc>) -> Vec<ScheduledItem<T>> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|item| item.time <= horizon) {
            let Some(item) = self.queue.pop() else { break };
            self.by_id.remove(&item.id);
            if item.is_committed() {
                due.push(item);
            } else {
                debug!("Option {} expired unclaimed", item.id);
            }
        }
        due
    }

    /// Put popped items that were not delivered back in the queue
    fn requeue(&mut self, items: impl IntoIterator<Item = ScheduledItem<T>>) {
        for item in items {
            self.by_id.insert(item.id.clone(), item.time);
            self.queue.push(item);
        }
    }

    fn remove(&mut self, id: &str) -> Option<ScheduledItem<T>> {
        let time = self.by_id.remove(id)?;
        self.queue.remove(id, time)
    }
}

/// Downlink schedule of one gateway
pub struct Schedule<T> {
    config: ScheduleConfig,
    state: Arc<RwLock<ScheduleState<T>>>,
    subscription: Mutex<Option<CancellationToken>>,
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Schedule<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("active", &self.is_active())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Schedule<T> {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ScheduleState {
                offset: Utc::now(),
                queue: DownlinkQueue::new(),
                by_id: HashMap::new(),
            })),
            subscription: Mutex::new(None),
        }
    }

    /// Align the gateway counter with the wall clock: `timestamp` is now
    pub fn sync(&self, timestamp: u32) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.offset = Utc::now() - ChronoDuration::microseconds(i64::from(timestamp));
    }

    /// Wall-clock time of the next occurrence of `timestamp`, never in the past
    pub fn realtime(&self, timestamp: u32) -> DateTime<Utc> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.realtime(timestamp, Utc::now())
    }

    /// Hold a slot at `timestamp` for `length` µs, returning its id and conflict score
    pub fn get_option(&self, timestamp: u32, length: u32) -> (String, u32) {
        let id = random_id();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let score = state
            .queue
            .iter()
            .filter(|item| item.overlaps(timestamp, length))
            .map(|item| {
                if item.is_committed() {
                    self.config.committed_weight
                } else {
                    self.config.held_weight
                }
            })
            .fold(0u32, u32::saturating_add);

        let time = state.realtime(timestamp, Utc::now());
        state.by_id.insert(id.clone(), time);
        state.queue.push(ScheduledItem {
            id: id.clone(),
            time,
            timestamp,
            length,
            score,
            payload: None,
        });
        (id, score)
    }

    /// Commit `payload` to the held option `id`
    pub fn schedule(&self, id: &str, payload: T) -> Result<(), ScheduleError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let time = *state
            .by_id
            .get(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        let item = state
            .queue
            .find_mut(id, time)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        if item.payload.is_some() {
            debug!("Option {id} committed again, replacing payload");
        }
        item.payload = Some(payload);
        Ok(())
    }

    /// Give up the held option `id` so it no longer counts as a conflict
    ///
    /// Committed options are left in place. Returns whether a hold was released.
    pub fn release(&self, id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(&time) = state.by_id.get(id) else {
            return false;
        };
        if state.queue.find_mut(id, time).is_some_and(|item| item.is_committed()) {
            return false;
        }
        state.remove(id).is_some()
    }

    /// Start the delivery loop; only one subscriber at a time
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<T>, ScheduleError> {
        let mut subscription = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        if subscription.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return Err(ScheduleError::AlreadySubscribed);
        }

        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let cancel = CancellationToken::new();
        *subscription = Some(cancel.clone());

        tokio::spawn(delivery_loop(
            Arc::clone(&self.state),
            tx,
            cancel,
            self.config.clone(),
        ));
        Ok(rx)
    }

    /// Stop the delivery loop; the subscriber channel closes once the loop exits
    pub fn stop(&self) {
        let token = self.subscription.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Items currently held or committed
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Schedule<T> {
    fn drop(&mut self) {
        if let Some(token) = self.subscription.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

/// Sole owner of the subscriber sender; the channel closes when this returns
async fn delivery_loop<T>(
    state: Arc<RwLock<ScheduleState<T>>>,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    config: ScheduleConfig,
) {
    let deadline = ChronoDuration::milliseconds(config.deadline_ms as i64);
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'poll,
            _ = ticker.tick() => {}
        }

        let mut due = {
            let mut state = state.write().unwrap_or_else(|e| e.into_inner());
            state.take_due(Utc::now() + deadline)
        }
        .into_iter();

        // A send slot is reserved before an item leaves `due`, so an
        // interrupted batch can go back to the queue intact
        while !due.as_slice().is_empty() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = tx.reserve() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("Downlink subscriber went away, stopping delivery");
                        cancel.cancel();
                        None
                    }
                },
            };
            let Some(permit) = permit else {
                let undelivered: Vec<_> = due.collect();
                debug!("Returning {} undelivered downlinks to the queue", undelivered.len());
                state.write().unwrap_or_else(|e| e.into_inner()).requeue(undelivered);
                break 'poll;
            };
            if let Some(payload) = due.next().and_then(|item| item.payload) {
                permit.send(payload);
            }
        }
    }
    debug!("Delivery loop stopped");
}

fn random_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn schedule() -> Schedule<&'static str> {
        Schedule::new(ScheduleConfig::default())
    }

    #[test]
    fn test_queue_keeps_time_order() {
        let now = Utc::now();
        let mut queue = DownlinkQueue::new();
        for (id, ms) in [("c", 30), ("a", 10), ("b", 20), ("a2", 10)] {
            queue.push(ScheduledItem {
                id: id.to_string(),
                time: now + ChronoDuration::milliseconds(ms),
                timestamp: 0,
                length: 0,
                score: 0,
                payload: None::<()>,
            });
        }
        let ids: Vec<_> = queue.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "a2", "b", "c"]);
        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.peek().unwrap().id, "a2");
    }

    #[test]
    fn test_conflict_weights() {
        let s = schedule();
        s.sync(0);
        let (held, score) = s.get_option(1_000_000, 50_000);
        assert_eq!(score, 0);
        let (_, score) = s.get_option(1_020_000, 50_000);
        assert_eq!(score, 1);

        s.schedule(&held, "payload").unwrap();
        let (_, score) = s.get_option(1_040_000, 50_000);
        assert_eq!(score, 10 + 1);

        let (_, score) = s.get_option(2_000_000, 50_000);
        assert_eq!(score, 0);
    }

    #[test]
    fn test_overlap_across_wrap() {
        assert!(windows_overlap(u32::MAX - 10, 100, 5, 10));
        assert!(windows_overlap(5, 10, u32::MAX - 10, 100));
        assert!(!windows_overlap(u32::MAX - 10, 10, 5, 10));
    }

    #[test]
    fn test_schedule_unknown_id() {
        let s = schedule();
        let (id, _) = s.get_option(1_000_000, 10);
        assert_eq!(
            s.schedule("unknown-id", "x"),
            Err(ScheduleError::NotFound("unknown-id".into()))
        );
        assert_eq!(s.len(), 1);
        s.schedule(&id, "y").unwrap();
    }

    #[test]
    fn test_realtime_wraps_to_next_occurrence() {
        let s = schedule();
        s.sync(1_000_000);
        let before = Utc::now();
        // 500ms behind the synced counter: next occurrence is one wrap later
        let t = s.realtime(500_000);
        let expected = before - ChronoDuration::milliseconds(500)
            + ChronoDuration::microseconds(GATEWAY_TIMESTAMP_WRAP_US as i64);
        assert!((t - expected).num_milliseconds().abs() < 100);
    }

    #[tokio::test]
    async fn test_delivery_in_time_order() {
        let s = schedule();
        s.sync(0);
        let (late, _) = s.get_option(120_000, 1000);
        let (early, _) = s.get_option(80_000, 1000);
        let (_unclaimed, _) = s.get_option(90_000, 1000);
        s.schedule(&late, "late").unwrap();
        s.schedule(&early, "early").unwrap();

        let mut rx = s.subscribe().unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some("early"));
        assert_eq!(second, Some("late"));
        assert!(s.is_empty());
        assert_eq!(s.schedule(&late, "again"), Err(ScheduleError::NotFound(late.clone())));
        s.stop();
    }

    #[tokio::test]
    async fn test_single_subscriber() {
        let s = schedule();
        let _rx = s.subscribe().unwrap();
        assert_eq!(s.subscribe().unwrap_err(), ScheduleError::AlreadySubscribed);
        s.stop();
        s.stop();
        assert!(!s.is_active());
        let _rx = s.subscribe().unwrap();
        s.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_channel() {
        let s = schedule();
        let mut rx = s.subscribe().unwrap();
        s.stop();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_stop_keeps_undelivered_batch() {
        let s = Schedule::new(ScheduleConfig {
            stream_buffer: 1,
            ..Default::default()
        });
        s.sync(0);
        for (n, payload) in ["first", "second", "third"].into_iter().enumerate() {
            let (id, _) = s.get_option(1_000 + n as u32, 10);
            s.schedule(&id, payload).unwrap();
        }

        // One payload fills the channel, the loop then waits for room
        let mut rx = s.subscribe().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.stop();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some("first"));
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
        assert_eq!(s.len(), 2);

        let mut rx = s.subscribe().unwrap();
        for expected in ["second", "third"] {
            let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
            assert_eq!(next, Some(expected));
        }
        assert!(s.is_empty());
        s.stop();
    }

    #[test]
    fn test_release_held_option() {
        let s = schedule();
        s.sync(0);
        let (held, _) = s.get_option(1_000_000, 50_000);
        let (committed, _) = s.get_option(1_000_000, 50_000);
        s.schedule(&committed, "payload").unwrap();

        assert!(s.release(&held));
        assert!(!s.release(&held));
        assert!(!s.release(&committed));
        assert!(!s.release("unknown-id"));
        assert_eq!(s.len(), 1);
        assert_eq!(s.schedule(&held, "late"), Err(ScheduleError::NotFound(held.clone())));

        // Only the committed item still conflicts
        let (_, score) = s.get_option(1_010_000, 50_000);
        assert_eq!(score, 10);
    }

    proptest! {
        #[test]
        fn prop_realtime_never_in_the_past(synced in any::<u32>(), timestamp in any::<u32>()) {
            let s = schedule();
            s.sync(synced);
            let before = Utc::now();
            prop_assert!(s.realtime(timestamp) >= before);
        }

        #[test]
        fn prop_overlap_is_symmetric(a in any::<u32>(), la in 0u32..1_000_000, b in any::<u32>(), lb in 0u32..1_000_000) {
            prop_assert_eq!(windows_overlap(a, la, b, lb), windows_overlap(b, lb, a, la));
        }

        #[test]
        fn prop_score_counts_overlaps(starts in proptest::collection::vec(0u32..10_000_000, 0..20), query in 0u32..10_000_000) {
            let s = schedule();
            for start in &starts {
                s.get_option(*start, 100_000);
            }
            let expected = starts.iter().filter(|&&start| windows_overlap(start, 100_000, query, 100_000)).count() as u32;
            let (_, score) = s.get_option(query, 100_000);
            prop_assert_eq!(score, expected);
        }
    }
}
