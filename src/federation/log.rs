//! Per-peer replication log
//!
//! Ids start at 1 and never repeat, even across [`EventLog::clear`]. The
//! acknowledged position is durable; the read cursor is not. Reopening a
//! log (or restarting the broker) puts the cursor just past the last
//! acknowledged id, which is what makes unacknowledged events come back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{EventPayload, FederationError, FederationEvent};
use crate::persistence::{Journal, JournalOp, StoredEvent, StoredLogMeta};

type Result<T> = std::result::Result<T, FederationError>;

/// Ordered, acknowledgeable event queue for one peer
#[async_trait]
pub trait EventLog: Send + Sync {
    fn peer(&self) -> &str;

    /// Start serving reads; the cursor moves to just past the acked id
    async fn open(&self) -> Result<()>;

    /// Stop serving; pending `fetch_events` calls return `Closed`
    async fn close(&self) -> Result<()>;

    /// Append to the tail and return the new event id
    async fn add(&self, origin: Arc<str>, payload: EventPayload) -> Result<u64>;

    /// Up to `max` events from the read cursor, waiting while there are none
    async fn fetch_events(&self, max: usize) -> Result<Vec<FederationEvent>>;

    /// Like `fetch_events` but returns an empty batch instead of waiting
    fn try_fetch_events(&self, max: usize) -> Result<Vec<FederationEvent>>;

    /// Acknowledge every event up to and including `id`
    async fn ack(&self, id: u64) -> Result<()>;

    /// Move the read cursor to `id`; it never goes behind the acked id
    async fn set_read_position(&self, id: u64) -> Result<()>;

    /// Discard all events, e.g. before a full resync
    async fn clear(&self) -> Result<()>;

    /// Incarnation stamped on every event this log produces
    fn epoch(&self) -> u64;

    /// Id the next fetch starts from
    fn read_position(&self) -> u64;

    /// Highest acknowledged id (0 = none)
    fn acked(&self) -> u64;

    /// Events retained (not yet acknowledged)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct LogState {
    epoch: u64,
    events: VecDeque<FederationEvent>,
    next_id: u64,
    acked: u64,
    read_pos: u64,
}

impl LogState {
    fn meta(&self) -> StoredLogMeta {
        StoredLogMeta {
            epoch: self.epoch,
            acked: self.acked,
            next_id: self.next_id,
        }
    }
}

/// Epoch for a log that has no stored state. Wall-clock based so a
/// restarted process moves forward; strictly increasing within a process.
fn new_epoch() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let previous = LAST
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(nanos.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    nanos.max(previous + 1)
}

/// [`EventLog`] kept in memory and written through a [`Journal`]
pub struct LocalEventLog {
    peer: Arc<str>,
    journal: Arc<dyn Journal>,
    state: Mutex<LogState>,
    open: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl LocalEventLog {
    pub fn new(peer: impl Into<Arc<str>>, journal: Arc<dyn Journal>) -> Self {
        Self::restore(peer, journal, Vec::new(), StoredLogMeta::default())
    }

    /// Rebuild from stored events and cursor metadata
    pub fn restore(
        peer: impl Into<Arc<str>>,
        journal: Arc<dyn Journal>,
        mut events: Vec<FederationEvent>,
        meta: StoredLogMeta,
    ) -> Self {
        events.sort_by_key(|e| e.id);
        events.retain(|e| e.id > meta.acked);
        let tail = events.last().map_or(0, |e| e.id);
        let next_id = meta.next_id.max(tail + 1).max(meta.acked + 1);
        let epoch = if meta.epoch == 0 { new_epoch() } else { meta.epoch };
        Self {
            peer: peer.into(),
            journal,
            state: Mutex::new(LogState {
                epoch,
                events: events.into(),
                next_id,
                acked: meta.acked,
                read_pos: meta.acked + 1,
            }),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || !self.open.load(Ordering::Acquire) {
            return Err(FederationError::Closed);
        }
        Ok(())
    }

    fn meta_op(&self, state: &LogState) -> JournalOp {
        JournalOp::PutLogMeta {
            peer: self.peer.to_string(),
            meta: state.meta(),
        }
    }
}

#[async_trait]
impl EventLog for LocalEventLog {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FederationError::Closed);
        }
        let mut state = self.state.lock();
        state.read_pos = state.acked + 1;
        self.open.store(true, Ordering::Release);
        debug!(
            peer = %self.peer,
            pending = state.events.len(),
            acked = state.acked,
            "federation log opened"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.open.store(false, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn add(&self, origin: Arc<str>, payload: EventPayload) -> Result<u64> {
        self.ensure_open()?;
        let id = {
            let mut state = self.state.lock();
            let event = FederationEvent {
                id: state.next_id,
                epoch: state.epoch,
                origin,
                payload,
            };
            state.next_id += 1;
            if self.journal.is_durable() {
                let ops = vec![
                    JournalOp::PutEvent {
                        peer: self.peer.to_string(),
                        event: StoredEvent::from(&event),
                    },
                    self.meta_op(&state),
                ];
                if let Err(e) = self.journal.apply(ops) {
                    state.next_id -= 1;
                    return Err(e.into());
                }
            }
            trace!(peer = %self.peer, id = event.id, kind = event.kind(), "federation event added");
            let id = event.id;
            state.events.push_back(event);
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn fetch_events(&self, max: usize) -> Result<Vec<FederationEvent>> {
        loop {
            // Registered before checking so an add in between is not missed
            let notified = self.notify.notified();
            let batch = self.try_fetch_events(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            notified.await;
        }
    }

    fn try_fetch_events(&self, max: usize) -> Result<Vec<FederationEvent>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let read_pos = state.read_pos;
        let start = state.events.partition_point(|e| e.id < read_pos);
        let batch: Vec<FederationEvent> = state.events.range(start..).take(max).cloned().collect();
        if let Some(last) = batch.last() {
            state.read_pos = last.id + 1;
        }
        Ok(batch)
    }

    async fn ack(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let id = id.min(state.next_id - 1);
        if id <= state.acked {
            return Ok(());
        }
        if self.journal.is_durable() {
            let mut ops: Vec<JournalOp> = state
                .events
                .iter()
                .take_while(|e| e.id <= id)
                .map(|e| JournalOp::DeleteEvent {
                    peer: self.peer.to_string(),
                    id: e.id,
                })
                .collect();
            ops.push(JournalOp::PutLogMeta {
                peer: self.peer.to_string(),
                meta: StoredLogMeta {
                    acked: id,
                    ..state.meta()
                },
            });
            self.journal.apply(ops)?;
        }
        state.acked = id;
        while state.events.front().is_some_and(|e| e.id <= id) {
            state.events.pop_front();
        }
        if state.read_pos <= id {
            state.read_pos = id + 1;
        }
        trace!(peer = %self.peer, acked = id, "federation log acknowledged");
        Ok(())
    }

    async fn set_read_position(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.read_pos = id.clamp(state.acked + 1, state.next_id);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let acked = state.next_id - 1;
        if self.journal.is_durable() {
            self.journal.apply(vec![
                JournalOp::ClearEvents {
                    peer: self.peer.to_string(),
                },
                JournalOp::PutLogMeta {
                    peer: self.peer.to_string(),
                    meta: StoredLogMeta {
                        acked,
                        ..state.meta()
                    },
                },
            ])?;
        }
        state.events.clear();
        state.acked = acked;
        state.read_pos = state.next_id;
        debug!(peer = %self.peer, "federation log cleared");
        Ok(())
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    fn read_position(&self) -> u64 {
        self.state.lock().read_pos
    }

    fn acked(&self) -> u64 {
        self.state.lock().acked
    }

    fn len(&self) -> usize {
        self.state.lock().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NullJournal;
    use crate::protocol::{Message, QoS};
    use std::time::Duration;

    fn publish(payload: &'static str) -> EventPayload {
        EventPayload::Publish(Arc::new(Message::new("t", payload, QoS::AtLeastOnce)))
    }

    async fn open_log() -> LocalEventLog {
        let log = LocalEventLog::new("peer-b", Arc::new(NullJournal));
        log.open().await.unwrap();
        log
    }

    fn ids(events: &[FederationEvent]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn test_fetch_advances_cursor_and_ack_trims() {
        let log = open_log().await;
        for p in ["a", "b", "c"] {
            log.add("node-a".into(), publish(p)).await.unwrap();
        }

        assert_eq!(ids(&log.fetch_events(2).await.unwrap()), vec![1, 2]);
        assert_eq!(ids(&log.try_fetch_events(10).unwrap()), vec![3]);
        assert!(log.try_fetch_events(10).unwrap().is_empty());

        log.ack(2).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.acked(), 2);
        // Acks never move backwards
        log.ack(1).await.unwrap();
        assert_eq!(log.acked(), 2);
    }

    #[tokio::test]
    async fn test_set_read_position_replays() {
        let log = open_log().await;
        for p in ["a", "b", "c"] {
            log.add("node-a".into(), publish(p)).await.unwrap();
        }
        log.try_fetch_events(10).unwrap();
        log.ack(1).await.unwrap();

        log.set_read_position(0).await.unwrap();
        assert_eq!(log.read_position(), 2);
        assert_eq!(ids(&log.try_fetch_events(10).unwrap()), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_reopen_resends_unacked() {
        let log = open_log().await;
        log.add("node-a".into(), publish("a")).await.unwrap();
        log.add("node-a".into(), publish("b")).await.unwrap();
        log.try_fetch_events(10).unwrap();

        log.open().await.unwrap();
        assert_eq!(ids(&log.try_fetch_events(10).unwrap()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_clear_keeps_ids_monotonic() {
        let log = open_log().await;
        log.add("node-a".into(), publish("a")).await.unwrap();
        log.add("node-a".into(), publish("b")).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.is_empty());
        assert_eq!(log.acked(), 2);

        let id = log.add("node-a".into(), publish("c")).await.unwrap();
        assert_eq!(id, 3);
        assert_eq!(ids(&log.try_fetch_events(10).unwrap()), vec![3]);
    }

    #[tokio::test]
    async fn test_epoch_survives_restore_only() {
        let log = open_log().await;
        log.add("node-a".into(), publish("a")).await.unwrap();
        let event = log.try_fetch_events(1).unwrap().remove(0);
        assert_eq!(event.epoch, log.epoch());

        let stored = StoredLogMeta {
            epoch: log.epoch(),
            acked: 0,
            next_id: 2,
        };
        let restored = LocalEventLog::restore("peer-b", Arc::new(NullJournal), vec![event], stored);
        assert_eq!(restored.epoch(), log.epoch());

        let fresh = LocalEventLog::new("peer-b", Arc::new(NullJournal));
        assert_ne!(fresh.epoch(), log.epoch());
        assert!(fresh.epoch() > log.epoch());
    }

    #[tokio::test]
    async fn test_fetch_waits_for_add() {
        let log = Arc::new(open_log().await);
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.fetch_events(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.add("node-a".into(), publish("late")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ids(&batch), vec![1]);
    }

    #[tokio::test]
    async fn test_close_wakes_fetch() {
        let log = Arc::new(open_log().await);
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.fetch_events(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FederationError::Closed)));
        assert!(matches!(
            log.add("node-a".into(), publish("x")).await,
            Err(FederationError::Closed)
        ));
    }
}
