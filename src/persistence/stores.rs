//! Store implementations shared by the memory and fjall backends
//!
//! Working state lives in memory; every change that must survive a restart
//! is described as [`JournalOp`]s and written through the backend's
//! [`Journal`] before the call returns. Only QoS 1/2 queue entries are
//! journaled.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::error::Result;
use super::journal::{Journal, JournalOp};
use super::models::{
    StoredMessage, StoredQueueEntry, StoredSession, StoredSubscription, StoredUnack,
};
use super::store::{QueueStore, RetainedStore, SessionStore, SubscriptionStore, UnackStore};
use crate::protocol::{now_millis, Message};
use crate::queue::{
    DropReason, ExpireReport, OutboundQueue, QueueEntry, QueueError, QueueNotifier,
};
use crate::session::{Session, UnackError, UnackRecord, UnackState, UnackTable};
use crate::topic::{topic_matches_filter, Subscription, SubscriptionIndex};

/// Apply ops built lazily, skipping the work for non-durable journals
fn write<F>(journal: &dyn Journal, build: F) -> Result<()>
where
    F: FnOnce() -> Vec<JournalOp>,
{
    if !journal.is_durable() {
        return Ok(());
    }
    let ops = build();
    if ops.is_empty() {
        return Ok(());
    }
    journal.apply(ops)
}

fn put_entry(client_id: &str, entry: &QueueEntry) -> Option<JournalOp> {
    entry.qos.needs_ack().then(|| JournalOp::PutQueueEntry {
        client_id: client_id.to_string(),
        entry: StoredQueueEntry::from(entry),
    })
}

fn delete_entry(client_id: &str, entry: &QueueEntry) -> Option<JournalOp> {
    entry.qos.needs_ack().then(|| JournalOp::DeleteQueueEntry {
        client_id: client_id.to_string(),
        seq: entry.seq,
    })
}

// ============================================================================
// Sessions
// ============================================================================

pub struct LocalSessionStore {
    sessions: DashMap<Arc<str>, Session>,
    journal: Arc<dyn Journal>,
}

impl LocalSessionStore {
    pub(crate) fn new(journal: Arc<dyn Journal>, sessions: Vec<Session>) -> Self {
        Self {
            sessions: sessions
                .into_iter()
                .map(|s| (s.client_id.clone(), s))
                .collect(),
            journal,
        }
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn create(&self, session: Session) -> Result<()> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::PutSession {
                session: StoredSession::from(&session),
            }]
        })?;
        self.sessions.insert(session.client_id.clone(), session);
        Ok(())
    }

    async fn get(&self, client_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(client_id).map(|s| s.clone()))
    }

    async fn delete(&self, client_id: &str) -> Result<bool> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::DeleteSession {
                client_id: client_id.to_string(),
            }]
        })?;
        Ok(self.sessions.remove(client_id).is_some())
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.iter().map(|s| s.value().clone()).collect())
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

pub struct LocalSubscriptionStore {
    index: SubscriptionIndex,
    journal: Arc<dyn Journal>,
}

impl LocalSubscriptionStore {
    pub(crate) fn new(journal: Arc<dyn Journal>, subscriptions: Vec<Subscription>) -> Self {
        let index = SubscriptionIndex::new();
        for sub in subscriptions {
            index.subscribe(sub);
        }
        Self { index, journal }
    }
}

#[async_trait]
impl SubscriptionStore for LocalSubscriptionStore {
    async fn subscribe(&self, subscription: Subscription) -> Result<bool> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::PutSubscription {
                subscription: StoredSubscription::from(&subscription),
            }]
        })?;
        Ok(self.index.subscribe(subscription))
    }

    async fn unsubscribe(
        &self,
        client_id: &str,
        filter: &str,
        share_group: Option<&str>,
    ) -> Result<bool> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::DeleteSubscription {
                client_id: client_id.to_string(),
                filter: filter.to_string(),
                share_group: share_group.map(str::to_string),
            }]
        })?;
        Ok(self.index.unsubscribe(client_id, filter, share_group))
    }

    async fn unsubscribe_all(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let held = self.index.client_subscriptions(client_id);
        write(self.journal.as_ref(), || {
            held.iter()
                .map(|s| JournalOp::DeleteSubscription {
                    client_id: client_id.to_string(),
                    filter: s.filter.to_string(),
                    share_group: s.share_group.as_deref().map(str::to_string),
                })
                .collect()
        })?;
        Ok(self.index.unsubscribe_all(client_id))
    }

    fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        self.index.matches(topic)
    }

    async fn client_subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>> {
        Ok(self.index.client_subscriptions(client_id))
    }

    fn count(&self) -> usize {
        self.index.count()
    }
}

// ============================================================================
// Outbound queues
// ============================================================================

pub struct LocalQueueStore {
    client_id: Arc<str>,
    queue: Mutex<OutboundQueue>,
    notifier: RwLock<Arc<dyn QueueNotifier>>,
    journal: Arc<dyn Journal>,
}

impl LocalQueueStore {
    pub(crate) fn new(
        client_id: Arc<str>,
        queue: OutboundQueue,
        notifier: Arc<dyn QueueNotifier>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            client_id,
            queue: Mutex::new(queue),
            notifier: RwLock::new(notifier),
            journal,
        }
    }

    /// Route readiness and drop events to a new listener (e.g. after the
    /// client reconnects)
    pub(crate) fn set_notifier(&self, notifier: Arc<dyn QueueNotifier>) {
        *self.notifier.write() = notifier;
    }

    fn notifier(&self) -> Arc<dyn QueueNotifier> {
        self.notifier.read().clone()
    }

    fn report_drops(&self, dropped: impl IntoIterator<Item = (QueueEntry, DropReason)>) {
        let notifier = self.notifier();
        for (entry, reason) in dropped {
            notifier.on_dropped(&self.client_id, &entry, reason);
        }
    }
}

#[async_trait]
impl QueueStore for LocalQueueStore {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn init(&self, clean_start: bool) -> std::result::Result<(), QueueError> {
        let ready = {
            let mut queue = self.queue.lock();
            if clean_start {
                let cleared = queue.clear();
                trace!(client_id = %self.client_id, count = cleared.len(), "queue cleared on clean start");
                write(self.journal.as_ref(), || {
                    vec![JournalOp::ClearQueue {
                        client_id: self.client_id.to_string(),
                    }]
                })?;
            } else {
                queue.resume();
                write(self.journal.as_ref(), || {
                    let mut ops = vec![JournalOp::ClearQueue {
                        client_id: self.client_id.to_string(),
                    }];
                    ops.extend(queue.entries().filter_map(|e| put_entry(&self.client_id, e)));
                    ops
                })?;
            }
            queue.has_deliverable()
        };
        if ready {
            self.notifier().on_ready(&self.client_id);
        }
        Ok(())
    }

    async fn enqueue(&self, entry: QueueEntry) -> std::result::Result<u64, QueueError> {
        let (seq, evicted, ready) = {
            let mut queue = self.queue.lock();
            let outcome = queue.enqueue(entry, now_millis())?;
            let written = write(self.journal.as_ref(), || {
                let mut ops: Vec<JournalOp> = outcome
                    .evicted
                    .iter()
                    .filter_map(|e| delete_entry(&self.client_id, e))
                    .collect();
                if let Some(added) = queue.get(outcome.seq) {
                    ops.extend(put_entry(&self.client_id, added));
                }
                ops
            });
            if let Err(e) = written {
                queue.remove(outcome.seq);
                if let Some(evicted) = outcome.evicted {
                    queue.reinsert(evicted);
                }
                return Err(e.into());
            }
            (outcome.seq, outcome.evicted, queue.has_deliverable())
        };

        if let Some(evicted) = evicted {
            self.report_drops([(evicted, DropReason::QueueFull)]);
        }
        if ready {
            self.notifier().on_ready(&self.client_id);
        }
        Ok(seq)
    }

    async fn dequeue(&self) -> std::result::Result<Option<QueueEntry>, QueueError> {
        let out = {
            let mut queue = self.queue.lock();
            let out = queue.dequeue(now_millis())?;
            write(self.journal.as_ref(), || {
                let mut ops: Vec<JournalOp> = out
                    .expired
                    .iter()
                    .filter_map(|e| delete_entry(&self.client_id, e))
                    .collect();
                if let Some(entry) = &out.entry {
                    ops.extend(put_entry(&self.client_id, entry));
                }
                ops
            })?;
            out
        };
        self.report_drops(out.expired.into_iter().map(|e| (e, DropReason::Expired)));
        Ok(out.entry)
    }

    async fn mark_inflight(&self, packet_id: u16) -> std::result::Result<QueueEntry, QueueError> {
        let mut queue = self.queue.lock();
        let entry = queue.mark_inflight(packet_id, now_millis())?;
        write(self.journal.as_ref(), || {
            put_entry(&self.client_id, &entry).into_iter().collect()
        })?;
        Ok(entry)
    }

    async fn release(&self, packet_id: u16) -> std::result::Result<(), QueueError> {
        let mut queue = self.queue.lock();
        let entry = queue.release(packet_id, now_millis())?;
        write(self.journal.as_ref(), || {
            put_entry(&self.client_id, &entry).into_iter().collect()
        })?;
        Ok(())
    }

    async fn ack(&self, packet_id: u16) -> std::result::Result<Option<QueueEntry>, QueueError> {
        let (acked, ready) = {
            let mut queue = self.queue.lock();
            let Some(acked) = queue.ack(packet_id) else {
                trace!(client_id = %self.client_id, packet_id, "ack for unknown packet id ignored");
                return Ok(None);
            };
            write(self.journal.as_ref(), || {
                delete_entry(&self.client_id, &acked).into_iter().collect()
            })?;
            (acked, queue.has_deliverable())
        };
        if ready {
            self.notifier().on_ready(&self.client_id);
        }
        Ok(Some(acked))
    }

    async fn expire(&self) -> std::result::Result<ExpireReport, QueueError> {
        let mut report = {
            let mut queue = self.queue.lock();
            let report = queue.expire(now_millis());
            if report.is_empty() {
                return Ok(report);
            }
            let written = write(self.journal.as_ref(), || {
                let mut ops: Vec<JournalOp> = report
                    .dropped
                    .iter()
                    .filter_map(|(e, _)| delete_entry(&self.client_id, e))
                    .collect();
                ops.extend(report.redeliver.iter().filter_map(|e| put_entry(&self.client_id, e)));
                ops
            });
            if let Err(e) = written {
                drop(queue);
                // already gone from memory
                self.report_drops(report.dropped);
                return Err(e.into());
            }
            report
        };
        if !report.dropped.is_empty() {
            warn!(
                client_id = %self.client_id,
                count = report.dropped.len(),
                "inflight entries dropped by expiry sweep"
            );
        }
        self.report_drops(std::mem::take(&mut report.dropped).into_iter());
        Ok(report)
    }

    async fn released(&self) -> Vec<u16> {
        self.queue.lock().released()
    }

    async fn clear(&self) -> std::result::Result<(), QueueError> {
        let mut queue = self.queue.lock();
        queue.clear();
        write(self.journal.as_ref(), || {
            vec![JournalOp::ClearQueue {
                client_id: self.client_id.to_string(),
            }]
        })?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn inflight_len(&self) -> usize {
        self.queue.lock().inflight_len()
    }
}

// ============================================================================
// Unacknowledged QoS 2 exchanges
// ============================================================================

pub struct LocalUnackStore {
    client_id: Arc<str>,
    table: Mutex<UnackTable>,
    journal: Arc<dyn Journal>,
}

impl LocalUnackStore {
    pub(crate) fn new(client_id: Arc<str>, table: UnackTable, journal: Arc<dyn Journal>) -> Self {
        Self {
            client_id,
            table: Mutex::new(table),
            journal,
        }
    }

    fn put(&self, packet_id: u16, record: &UnackRecord) -> Vec<JournalOp> {
        vec![JournalOp::PutUnack {
            client_id: self.client_id.to_string(),
            packet_id,
            record: StoredUnack::from(record),
        }]
    }

    fn clear_op(&self) -> Vec<JournalOp> {
        vec![JournalOp::ClearUnacks {
            client_id: self.client_id.to_string(),
        }]
    }
}

#[async_trait]
impl UnackStore for LocalUnackStore {
    async fn init(&self, clean_start: bool) -> std::result::Result<(), UnackError> {
        if clean_start {
            self.sweep().await?;
        }
        Ok(())
    }

    async fn record(&self, packet_id: u16, state: UnackState) -> std::result::Result<bool, UnackError> {
        let mut table = self.table.lock();
        if table.record(packet_id, state, now_millis())? {
            return Ok(true);
        }
        let written = write(self.journal.as_ref(), || match table.get(packet_id) {
            Some(record) => self.put(packet_id, &record),
            None => Vec::new(),
        });
        if let Err(e) = written {
            table.clear(packet_id);
            return Err(e.into());
        }
        Ok(false)
    }

    async fn advance(&self, packet_id: u16, next: UnackState) -> std::result::Result<(), UnackError> {
        let mut table = self.table.lock();
        let record = table.advance(packet_id, next, now_millis())?;
        write(self.journal.as_ref(), || self.put(packet_id, &record))?;
        Ok(())
    }

    async fn clear(&self, packet_id: u16) -> std::result::Result<bool, UnackError> {
        let mut table = self.table.lock();
        if !table.clear(packet_id) {
            return Ok(false);
        }
        write(self.journal.as_ref(), || {
            vec![JournalOp::DeleteUnack {
                client_id: self.client_id.to_string(),
                packet_id,
            }]
        })?;
        Ok(true)
    }

    async fn sweep(&self) -> std::result::Result<Vec<u16>, UnackError> {
        let mut table = self.table.lock();
        let reclaimed = table.clear_all();
        write(self.journal.as_ref(), || self.clear_op())?;
        if !reclaimed.is_empty() {
            trace!(client_id = %self.client_id, count = reclaimed.len(), "unack records reclaimed");
        }
        Ok(reclaimed)
    }

    fn get(&self, packet_id: u16) -> Option<UnackRecord> {
        self.table.lock().get(packet_id)
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

// ============================================================================
// Retained messages
// ============================================================================

pub struct LocalRetainedStore {
    messages: DashMap<Arc<str>, Arc<Message>>,
    journal: Arc<dyn Journal>,
}

impl LocalRetainedStore {
    pub(crate) fn new(journal: Arc<dyn Journal>, messages: Vec<Message>) -> Self {
        Self {
            messages: messages
                .into_iter()
                .map(|m| (m.topic.clone(), Arc::new(m)))
                .collect(),
            journal,
        }
    }
}

#[async_trait]
impl RetainedStore for LocalRetainedStore {
    async fn set(&self, message: Arc<Message>) -> Result<()> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::PutRetained {
                message: StoredMessage::from(message.as_ref()),
            }]
        })?;
        self.messages.insert(message.topic.clone(), message);
        Ok(())
    }

    async fn remove(&self, topic: &str) -> Result<bool> {
        write(self.journal.as_ref(), || {
            vec![JournalOp::DeleteRetained {
                topic: topic.to_string(),
            }]
        })?;
        Ok(self.messages.remove(topic).is_some())
    }

    fn matching(&self, filter: &str) -> Vec<Arc<Message>> {
        let now = now_millis();
        self.messages
            .iter()
            .filter(|m| topic_matches_filter(m.key(), filter) && !m.value().is_expired(now))
            .map(|m| m.value().clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::QueueFaultJournal;
    use crate::protocol::QoS;
    use crate::queue::{FullPolicy, QueueSettings};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Drops(Mutex<Vec<DropReason>>);

    impl QueueNotifier for Drops {
        fn on_ready(&self, _client_id: &str) {}

        fn on_dropped(&self, _client_id: &str, _entry: &QueueEntry, reason: DropReason) {
            self.0.lock().push(reason);
        }
    }

    fn store(max_queued: usize) -> (LocalQueueStore, Arc<QueueFaultJournal>, Arc<Drops>) {
        let journal = Arc::new(QueueFaultJournal::default());
        let drops = Arc::new(Drops::default());
        let settings = QueueSettings {
            max_queued,
            full_policy: FullPolicy::DropOldest,
            ..QueueSettings::default()
        };
        let store = LocalQueueStore::new(
            Arc::from("c1"),
            OutboundQueue::new(settings),
            drops.clone(),
            journal.clone(),
        );
        (store, journal, drops)
    }

    fn entry(payload: &'static str) -> QueueEntry {
        QueueEntry::new(Arc::new(Message::new("t", payload, QoS::AtLeastOnce)), QoS::AtLeastOnce)
    }

    #[tokio::test]
    async fn test_failed_enqueue_keeps_evicted_entry() {
        let (store, journal, drops) = store(2);
        store.enqueue(entry("a")).await.unwrap();
        store.enqueue(entry("b")).await.unwrap();

        journal.arm(true);
        assert!(matches!(store.enqueue(entry("c")).await, Err(QueueError::Store(_))));
        assert_eq!(store.len(), 2);
        assert!(drops.0.lock().is_empty());

        journal.arm(false);
        let first = store.dequeue().await.unwrap().unwrap();
        assert_eq!(&first.message.payload[..], b"a");
    }

    #[tokio::test]
    async fn test_failed_expire_still_reports_drops() {
        let (store, journal, drops) = store(0);
        let stale = Message::new("t", "old", QoS::AtLeastOnce)
            .with_expiry(1)
            .with_created_at(0);
        store
            .enqueue(QueueEntry::new(Arc::new(stale), QoS::AtLeastOnce))
            .await
            .unwrap();

        journal.arm(true);
        assert!(store.expire().await.is_err());
        assert_eq!(store.len(), 0);
        assert_eq!(*drops.0.lock(), vec![DropReason::Expired]);
    }
}
