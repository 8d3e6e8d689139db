//! Fjall-based durable backend.
//!
//! Uses fjall (an LSM-tree based embedded database) as the journal beneath
//! the local stores. Each store kind gets its own partition; per-client and
//! per-peer records are keyed `owner\0suffix` so one client's rows can be
//! dropped with a prefix scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::error::{PersistenceError, Result};
use super::journal::{Journal, JournalOp, LoadedState};
use super::local::{LocalPersistence, StoreSettings};
use super::models::{
    decode, encode, StoredEvent, StoredLogMeta, StoredMessage, StoredQueueEntry, StoredSession,
    StoredSubscription, StoredUnack,
};

const SEP: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Part {
    Sessions,
    Subscriptions,
    Queues,
    Unacks,
    Retained,
    Events,
    LogMeta,
}

impl Part {
    const ALL: [Part; 7] = [
        Part::Sessions,
        Part::Subscriptions,
        Part::Queues,
        Part::Unacks,
        Part::Retained,
        Part::Events,
        Part::LogMeta,
    ];

    fn name(self) -> &'static str {
        match self {
            Part::Sessions => "sessions",
            Part::Subscriptions => "subscriptions",
            Part::Queues => "queues",
            Part::Unacks => "unacks",
            Part::Retained => "retained",
            Part::Events => "federation_events",
            Part::LogMeta => "federation_meta",
        }
    }
}

fn key(owner: &str, suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(owner.len() + 1 + suffix.len());
    k.extend_from_slice(owner.as_bytes());
    k.push(SEP);
    k.extend_from_slice(suffix);
    k
}

fn prefix(owner: &str) -> Vec<u8> {
    key(owner, &[])
}

fn subscription_key(client_id: &str, share_group: Option<&str>, filter: &str) -> Vec<u8> {
    let mut suffix = Vec::new();
    suffix.extend_from_slice(share_group.unwrap_or("").as_bytes());
    suffix.push(SEP);
    suffix.extend_from_slice(filter.as_bytes());
    key(client_id, &suffix)
}

/// Split `owner\0rest` at the first separator
fn split_key<'a>(part: Part, raw: &'a [u8]) -> Result<(String, &'a [u8])> {
    let at = raw
        .iter()
        .position(|b| *b == SEP)
        .ok_or_else(|| PersistenceError::bad_key(part.name(), raw))?;
    let owner = std::str::from_utf8(&raw[..at])
        .map_err(|_| PersistenceError::bad_key(part.name(), raw))?;
    Ok((owner.to_string(), &raw[at + 1..]))
}

fn be_u16(part: Part, raw: &[u8], bytes: &[u8]) -> Result<u16> {
    let arr: [u8; 2] = bytes
        .try_into()
        .map_err(|_| PersistenceError::bad_key(part.name(), raw))?;
    Ok(u16::from_be_bytes(arr))
}

struct FjallInner {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

impl FjallInner {
    fn partition(&self, part: Part) -> &PartitionHandle {
        &self.partitions[part as usize]
    }

    fn scan<T, F>(&self, part: Part, mut each: F) -> Result<Vec<T>>
    where
        F: FnMut(&[u8], &[u8]) -> Result<T>,
    {
        let mut out = Vec::new();
        for item in self.partition(part).iter() {
            let (k, v) = item?;
            out.push(each(&k, &v)?);
        }
        Ok(out)
    }
}

/// Pending writes of one batch, last write per key wins
#[derive(Default)]
struct Pending {
    writes: BTreeMap<(Part, Vec<u8>), Option<Vec<u8>>>,
}

impl Pending {
    fn put(&mut self, part: Part, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert((part, key), Some(value));
    }

    fn delete(&mut self, part: Part, key: Vec<u8>) {
        self.writes.insert((part, key), None);
    }

    /// Delete every stored and pending key under `prefix`
    fn clear(&mut self, inner: &FjallInner, part: Part, prefix: Vec<u8>) -> Result<()> {
        for item in inner.partition(part).prefix(&prefix) {
            let (k, _) = item?;
            self.writes.insert((part, k.to_vec()), None);
        }
        for ((p, k), v) in self.writes.iter_mut() {
            if *p == part && k.starts_with(&prefix) {
                *v = None;
            }
        }
        Ok(())
    }
}

/// [`Journal`] over a fjall keyspace
pub struct FjallJournal {
    path: PathBuf,
    inner: RwLock<Option<FjallInner>>,
    closed: AtomicBool,
}

impl FjallJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&FjallInner) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(PersistenceError::NotOpen)?;
        f(inner)
    }

    fn stage(inner: &FjallInner, pending: &mut Pending, op: JournalOp) -> Result<()> {
        match op {
            JournalOp::PutSession { session } => {
                pending.put(Part::Sessions, session.client_id.clone().into_bytes(), encode(&session)?);
            }
            JournalOp::DeleteSession { client_id } => {
                pending.delete(Part::Sessions, client_id.into_bytes());
            }
            JournalOp::PutSubscription { subscription } => {
                let k = subscription_key(
                    &subscription.client_id,
                    subscription.share_group.as_deref(),
                    &subscription.filter,
                );
                pending.put(Part::Subscriptions, k, encode(&subscription)?);
            }
            JournalOp::DeleteSubscription {
                client_id,
                filter,
                share_group,
            } => {
                let k = subscription_key(&client_id, share_group.as_deref(), &filter);
                pending.delete(Part::Subscriptions, k);
            }
            JournalOp::PutQueueEntry { client_id, entry } => {
                let k = key(&client_id, &entry.seq.to_be_bytes());
                pending.put(Part::Queues, k, encode(&entry)?);
            }
            JournalOp::DeleteQueueEntry { client_id, seq } => {
                pending.delete(Part::Queues, key(&client_id, &seq.to_be_bytes()));
            }
            JournalOp::ClearQueue { client_id } => {
                pending.clear(inner, Part::Queues, prefix(&client_id))?;
            }
            JournalOp::PutUnack {
                client_id,
                packet_id,
                record,
            } => {
                let k = key(&client_id, &packet_id.to_be_bytes());
                pending.put(Part::Unacks, k, encode(&record)?);
            }
            JournalOp::DeleteUnack {
                client_id,
                packet_id,
            } => {
                pending.delete(Part::Unacks, key(&client_id, &packet_id.to_be_bytes()));
            }
            JournalOp::ClearUnacks { client_id } => {
                pending.clear(inner, Part::Unacks, prefix(&client_id))?;
            }
            JournalOp::PutRetained { message } => {
                pending.put(Part::Retained, message.topic.clone().into_bytes(), encode(&message)?);
            }
            JournalOp::DeleteRetained { topic } => {
                pending.delete(Part::Retained, topic.into_bytes());
            }
            JournalOp::PutEvent { peer, event } => {
                let k = key(&peer, &event.id.to_be_bytes());
                pending.put(Part::Events, k, encode(&event)?);
            }
            JournalOp::DeleteEvent { peer, id } => {
                pending.delete(Part::Events, key(&peer, &id.to_be_bytes()));
            }
            JournalOp::ClearEvents { peer } => {
                pending.clear(inner, Part::Events, prefix(&peer))?;
            }
            JournalOp::PutLogMeta { peer, meta } => {
                pending.put(Part::LogMeta, peer.into_bytes(), encode(&meta)?);
            }
        }
        Ok(())
    }
}

impl Journal for FjallJournal {
    fn name(&self) -> &'static str {
        "fjall"
    }

    fn open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        let mut guard = self.inner.write();
        if guard.is_some() {
            return Ok(());
        }
        let keyspace = Config::new(&self.path).open()?;
        let partitions = Part::ALL
            .iter()
            .map(|p| keyspace.open_partition(p.name(), PartitionCreateOptions::default()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        info!(path = %self.path.display(), "fjall keyspace opened");
        *guard = Some(FjallInner {
            keyspace,
            partitions,
        });
        Ok(())
    }

    fn load(&self) -> Result<LoadedState> {
        self.with_inner(|inner| {
            let mut state = LoadedState {
                sessions: inner.scan(Part::Sessions, |_, v| decode::<StoredSession>(v))?,
                subscriptions: inner
                    .scan(Part::Subscriptions, |_, v| decode::<StoredSubscription>(v))?,
                retained: inner.scan(Part::Retained, |_, v| decode::<StoredMessage>(v))?,
                ..LoadedState::default()
            };

            for (client_id, entry) in inner.scan(Part::Queues, |k, v| {
                let (client_id, _) = split_key(Part::Queues, k)?;
                Ok((client_id, decode::<StoredQueueEntry>(v)?))
            })? {
                state.queues.entry(client_id).or_default().push(entry);
            }

            for (client_id, pid, record) in inner.scan(Part::Unacks, |k, v| {
                let (client_id, rest) = split_key(Part::Unacks, k)?;
                let pid = be_u16(Part::Unacks, k, rest)?;
                Ok((client_id, pid, decode::<StoredUnack>(v)?))
            })? {
                state.unacks.entry(client_id).or_default().push((pid, record));
            }

            // Big-endian ids keep each peer's events in id order
            for (peer, event) in inner.scan(Part::Events, |k, v| {
                let (peer, _) = split_key(Part::Events, k)?;
                Ok((peer, decode::<StoredEvent>(v)?))
            })? {
                state.events.entry(peer).or_default().push(event);
            }

            for (peer, meta) in inner.scan(Part::LogMeta, |k, v| {
                let peer = std::str::from_utf8(k)
                    .map_err(|_| PersistenceError::bad_key(Part::LogMeta.name(), k))?;
                Ok((peer.to_string(), decode::<StoredLogMeta>(v)?))
            })? {
                state.log_meta.insert(peer, meta);
            }

            debug!(
                sessions = state.sessions.len(),
                subscriptions = state.subscriptions.len(),
                queues = state.queues.len(),
                retained = state.retained.len(),
                "fjall state loaded"
            );
            Ok(state)
        })
    }

    fn apply(&self, ops: Vec<JournalOp>) -> Result<()> {
        self.with_inner(|inner| {
            let mut pending = Pending::default();
            for op in ops {
                Self::stage(inner, &mut pending, op)?;
            }
            let mut batch = inner.keyspace.batch();
            for ((part, k), v) in pending.writes {
                match v {
                    Some(value) => batch.insert(inner.partition(part), k, value),
                    None => batch.remove(inner.partition(part), k),
                }
            }
            batch.commit()?;
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.keyspace.persist(PersistMode::SyncAll)?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PersistenceError::Closed);
        }
        // fjall releases the keyspace on drop
        if let Some(inner) = self.inner.write().take() {
            inner.keyspace.persist(PersistMode::SyncAll)?;
            info!(path = %self.path.display(), "fjall keyspace closed");
        }
        Ok(())
    }
}

impl LocalPersistence {
    /// Durable backend stored under `path`
    pub fn fjall(settings: StoreSettings, path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(FjallJournal::new(path)), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::EventPayload;
    use crate::persistence::Persistence;
    use crate::protocol::{Message, QoS, SubscriptionOptions};
    use crate::queue::{DefaultNotifier, QueueEntry};
    use crate::session::{Session, UnackState};
    use crate::topic::Subscription;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn msg(topic: &str, payload: &'static [u8]) -> Arc<Message> {
        Arc::new(Message::new(topic, Bytes::from_static(payload), QoS::AtLeastOnce))
    }

    #[test]
    fn test_key_layout() {
        let k = subscription_key("c1", Some("g"), "a/b");
        assert_eq!(k, b"c1\0g\0a/b".to_vec());
        let (owner, rest) = split_key(Part::Subscriptions, &k).unwrap();
        assert_eq!(owner, "c1");
        assert_eq!(rest, b"g\0a/b");
        assert!(split_key(Part::Queues, b"noseparator").is_err());
        assert!(be_u16(Part::Unacks, b"x", &[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
            p.open().await.unwrap();
            p.session_store()
                .unwrap()
                .create(Session::new("c1", false, 3600, 1_000))
                .await
                .unwrap();
            let sub = Subscription::parse(
                "c1",
                "$share/g/sensors/#",
                SubscriptionOptions::with_qos(QoS::AtLeastOnce),
            )
            .unwrap();
            p.subscription_store().unwrap().subscribe(sub).await.unwrap();

            let queue = p.queue_store("c1", Arc::new(DefaultNotifier)).unwrap();
            for payload in [&b"one"[..], b"two", b"three"] {
                queue
                    .enqueue(QueueEntry::new(msg("sensors/a", payload), QoS::AtLeastOnce))
                    .await
                    .unwrap();
            }
            // QoS 0 entries are never written
            queue
                .enqueue(QueueEntry::new(msg("sensors/a", b"zero"), QoS::AtMostOnce))
                .await
                .unwrap();

            let unacks = p.unack_store("c1").unwrap();
            unacks.record(42, UnackState::Received).await.unwrap();
            unacks.advance(42, UnackState::PubRecSent).await.unwrap();

            p.retained_store()
                .unwrap()
                .set(Arc::new(
                    Message::new("status", Bytes::from_static(b"up"), QoS::AtLeastOnce)
                        .retained(true),
                ))
                .await
                .unwrap();
            p.close().await.unwrap();
        }

        let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
        p.open().await.unwrap();
        let session = p.session_store().unwrap().get("c1").await.unwrap().unwrap();
        assert_eq!(session.expiry_interval, 3600);
        let subs = p.subscription_store().unwrap();
        assert_eq!(subs.matches("sensors/x").len(), 1);

        let queue = p.existing_queue_store("c1").unwrap().unwrap();
        assert_eq!(queue.len(), 3);
        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(&first.message.payload[..], b"one");

        let unacks = p.unack_store("c1").unwrap();
        assert_eq!(unacks.get(42).unwrap().state, UnackState::PubRecSent);
        assert_eq!(p.retained_store().unwrap().count(), 1);
        p.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_client_is_durable() {
        let dir = TempDir::new().unwrap();
        {
            let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
            p.open().await.unwrap();
            let queue = p.queue_store("gone", Arc::new(DefaultNotifier)).unwrap();
            queue
                .enqueue(QueueEntry::new(msg("t", b"x"), QoS::AtLeastOnce))
                .await
                .unwrap();
            p.remove_client("gone").await.unwrap();
            p.close().await.unwrap();
        }
        let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
        p.open().await.unwrap();
        assert!(p.existing_queue_store("gone").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_log_fetches_unacked_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
            p.open().await.unwrap();
            let log = p.event_log("east").unwrap();
            log.open().await.unwrap();
            for i in 0..3 {
                let filter = format!("t/{}", i);
                log.add(Arc::from("local"), EventPayload::Subscribe(Arc::from(filter)))
                    .await
                    .unwrap();
            }
            let batch = log.try_fetch_events(10).unwrap();
            assert_eq!(batch.len(), 3);
            log.ack(1).await.unwrap();
            p.close().await.unwrap();
        }

        let p = LocalPersistence::fjall(StoreSettings::default(), dir.path());
        p.open().await.unwrap();
        let log = p.event_log("east").unwrap();
        log.open().await.unwrap();
        assert_eq!(log.acked(), 1);
        let ids: Vec<u64> = log
            .try_fetch_events(10)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
        let next = log
            .add(Arc::from("local"), EventPayload::Unsubscribe(Arc::from("t/0")))
            .await
            .unwrap();
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn test_closed_journal_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let journal = FjallJournal::new(dir.path());
        assert!(matches!(journal.flush(), Err(PersistenceError::NotOpen)));
        journal.open().unwrap();
        journal.close().unwrap();
        assert!(matches!(
            journal.apply(vec![JournalOp::DeleteSession {
                client_id: "x".into()
            }]),
            Err(PersistenceError::Closed)
        ));
    }
}
