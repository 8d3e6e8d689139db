//! Federation manager: interest tracking, replication and sender loops

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventLog, EventPayload, FederationError, FederationEvent, PeerLink};
use crate::metrics::Metrics;
use crate::protocol::Message;
use crate::topic::TopicTrie;

/// Tunables for replication
#[derive(Debug, Clone)]
pub struct FederationSettings {
    /// Name this node stamps on the events it produces
    pub node_name: Arc<str>,
    /// Maximum events handed to a link per send
    pub fetch_batch: usize,
    /// Delay before resending after a link failure
    pub retry_interval: Duration,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            node_name: Arc::from("local"),
            fetch_batch: 100,
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InboundMark {
    epoch: u64,
    id: u64,
}

/// Replicates local publishes to interested peers and accepts theirs
pub struct Federation {
    settings: FederationSettings,
    logs: AHashMap<Arc<str>, Arc<dyn EventLog>>,
    /// filter -> peers that advertised a subscriber for it
    peer_interest: RwLock<TopicTrie<AHashSet<Arc<str>>>>,
    /// filter -> local subscriber count, to advertise first/last only
    local_interest: Mutex<AHashMap<Arc<str>, usize>>,
    /// Highest event id accepted from each peer, per peer log epoch
    inbound_marks: DashMap<Arc<str>, InboundMark>,
    senders: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<Metrics>,
}

impl Federation {
    pub fn new(settings: FederationSettings, logs: Vec<Arc<dyn EventLog>>) -> Self {
        let logs = logs
            .into_iter()
            .map(|log| (Arc::<str>::from(log.peer()), log))
            .collect();
        Self {
            settings,
            logs,
            peer_interest: RwLock::new(TopicTrie::new()),
            local_interest: Mutex::new(AHashMap::new()),
            inbound_marks: DashMap::new(),
            senders: Mutex::new(Vec::new()),
            metrics: None,
        }
    }

    /// Count appended and acknowledged events in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node_name(&self) -> &Arc<str> {
        &self.settings.node_name
    }

    pub fn peers(&self) -> Vec<Arc<str>> {
        let mut peers: Vec<Arc<str>> = self.logs.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn log(&self, peer: &str) -> Result<Arc<dyn EventLog>, FederationError> {
        self.logs
            .get(peer)
            .cloned()
            .ok_or_else(|| FederationError::UnknownPeer(peer.to_string()))
    }

    pub async fn open(&self) -> Result<(), FederationError> {
        for log in self.logs.values() {
            log.open().await?;
        }
        info!(
            node = %self.settings.node_name,
            peers = self.logs.len(),
            "federation opened"
        );
        Ok(())
    }

    /// Append a local publish to every peer that has a matching subscriber
    /// and return those peers. Messages that arrived from a peer are never
    /// replicated again.
    pub async fn replicate(&self, message: &Arc<Message>) -> Result<Vec<Arc<str>>, FederationError> {
        if message
            .origin_node
            .as_ref()
            .is_some_and(|origin| *origin != self.settings.node_name)
        {
            return Ok(Vec::new());
        }

        let targets: Vec<Arc<str>> = {
            let mut peers = AHashSet::new();
            self.peer_interest.read().matches(&message.topic, |interested| {
                peers.extend(interested.iter().cloned());
            });
            peers.into_iter().collect()
        };

        for peer in &targets {
            let log = self.log(peer)?;
            log.add(
                self.settings.node_name.clone(),
                EventPayload::Publish(message.clone()),
            )
            .await?;
            if let Some(metrics) = &self.metrics {
                metrics.federation_appended(peer, 1);
            }
        }
        Ok(targets)
    }

    /// A local client subscribed to `filter`
    pub async fn local_subscribe(&self, filter: &str) -> Result<(), FederationError> {
        let first = {
            let mut interest = self.local_interest.lock();
            let count = interest.entry(Arc::from(filter)).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            self.broadcast(EventPayload::Subscribe(Arc::from(filter))).await?;
        }
        Ok(())
    }

    /// A local client dropped its subscription to `filter`
    pub async fn local_unsubscribe(&self, filter: &str) -> Result<(), FederationError> {
        let last = {
            let mut interest = self.local_interest.lock();
            match interest.get_mut(filter) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    interest.remove(filter);
                    true
                }
                None => false,
            }
        };
        if last {
            self.broadcast(EventPayload::Unsubscribe(Arc::from(filter))).await?;
        }
        Ok(())
    }

    async fn broadcast(&self, payload: EventPayload) -> Result<(), FederationError> {
        for log in self.logs.values() {
            log.add(self.settings.node_name.clone(), payload.clone()).await?;
        }
        Ok(())
    }

    /// Handle an event received from `peer`.
    ///
    /// Returns the message to dispatch locally for publish events that have
    /// not been seen before; re-sent events (id at or below the peer's mark
    /// for the same log epoch) are ignored.
    pub fn accept(
        &self,
        peer: &str,
        event: FederationEvent,
    ) -> Result<Option<Arc<Message>>, FederationError> {
        let peer_key = self
            .logs
            .get_key_value(peer)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| FederationError::UnknownPeer(peer.to_string()))?;

        let restarted = {
            let mut mark = self
                .inbound_marks
                .entry(peer_key.clone())
                .or_insert(InboundMark {
                    epoch: event.epoch,
                    id: 0,
                });
            let restarted = mark.epoch != event.epoch;
            if restarted {
                *mark = InboundMark {
                    epoch: event.epoch,
                    id: 0,
                };
            }
            if event.id <= mark.id {
                debug!(peer, id = event.id, "duplicate federation event dropped");
                return Ok(None);
            }
            mark.id = event.id;
            restarted
        };
        if restarted {
            // interest advertised by the previous incarnation is gone with it
            self.forget_peer_interest(peer);
            info!(peer, epoch = event.epoch, "federation peer log restarted");
        }

        match event.payload {
            EventPayload::Publish(message) => {
                let mut message = Arc::unwrap_or_clone(message);
                if message.origin_node.is_none() {
                    message.origin_node = Some(event.origin);
                }
                Ok(Some(Arc::new(message)))
            }
            EventPayload::Subscribe(filter) => {
                self.peer_interest
                    .write()
                    .get_or_insert_with(&filter, AHashSet::new)
                    .insert(peer_key);
                Ok(None)
            }
            EventPayload::Unsubscribe(filter) => {
                let mut trie = self.peer_interest.write();
                let now_empty = trie.get_mut(&filter).is_some_and(|peers| {
                    peers.remove(peer);
                    peers.is_empty()
                });
                if now_empty {
                    trie.remove(&filter);
                }
                Ok(None)
            }
        }
    }

    fn forget_peer_interest(&self, peer: &str) {
        let mut trie = self.peer_interest.write();
        trie.retain(|peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }

    /// Drain `peer`'s log over `link` until shutdown or the log closes.
    ///
    /// On a link failure the cursor is rewound to the first unacknowledged
    /// event and the batch is retried after `retry_interval`.
    pub fn spawn_sender(
        &self,
        link: Arc<dyn PeerLink>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), FederationError> {
        let log = self.log(link.peer())?;
        let batch = self.settings.fetch_batch.max(1);
        let retry = self.settings.retry_interval;
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            let peer = link.peer().to_string();
            loop {
                let events = tokio::select! {
                    _ = shutdown.recv() => break,
                    fetched = log.fetch_events(batch) => match fetched {
                        Ok(events) => events,
                        Err(FederationError::Closed) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "federation fetch failed");
                            tokio::time::sleep(retry).await;
                            continue;
                        }
                    },
                };

                let before = log.acked();
                let outcome = match link.send(&events).await {
                    Ok(confirmed) => log.ack(confirmed).await,
                    Err(e) => Err(e),
                };
                if let Some(metrics) = &metrics {
                    metrics.federation_acked(&peer, log.acked().saturating_sub(before));
                }
                if let Err(e) = outcome {
                    warn!(%peer, error = %e, "federation send failed, will resend");
                    let _ = log.set_read_position(log.acked() + 1).await;
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
            debug!(%peer, "federation sender exited");
        });
        self.senders.lock().push(handle);
        Ok(())
    }

    /// Close every log and wait for the sender tasks to finish
    pub async fn close(&self) -> Result<(), FederationError> {
        for log in self.logs.values() {
            log.close().await?;
        }
        let senders: Vec<JoinHandle<()>> = std::mem::take(&mut *self.senders.lock());
        for handle in senders {
            let _ = handle.await;
        }
        info!("federation closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::LocalEventLog;
    use crate::persistence::NullJournal;
    use crate::protocol::QoS;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn federation(peers: &[&str]) -> Federation {
        let logs: Vec<Arc<dyn EventLog>> = peers
            .iter()
            .map(|p| Arc::new(LocalEventLog::new(*p, Arc::new(NullJournal))) as Arc<dyn EventLog>)
            .collect();
        let fed = Federation::new(
            FederationSettings {
                node_name: Arc::from("node-a"),
                fetch_batch: 10,
                retry_interval: Duration::from_millis(10),
            },
            logs,
        );
        fed.open().await.unwrap();
        fed
    }

    fn event(id: u64, payload: EventPayload) -> FederationEvent {
        FederationEvent {
            id,
            epoch: 1,
            origin: Arc::from("node-b"),
            payload,
        }
    }

    fn msg(topic: &str) -> Arc<Message> {
        Arc::new(Message::new(topic, "v", QoS::AtLeastOnce))
    }

    #[tokio::test]
    async fn test_replicate_follows_peer_interest() {
        let fed = federation(&["node-b", "node-c"]).await;
        fed.accept("node-b", event(1, EventPayload::Subscribe(Arc::from("sensors/#"))))
            .unwrap();

        assert_eq!(fed.replicate(&msg("sensors/1")).await.unwrap().len(), 1);
        assert_eq!(fed.replicate(&msg("other")).await.unwrap().len(), 0);
        assert_eq!(fed.log("node-b").unwrap().len(), 1);
        assert_eq!(fed.log("node-c").unwrap().len(), 0);

        fed.accept("node-b", event(2, EventPayload::Unsubscribe(Arc::from("sensors/#"))))
            .unwrap();
        assert!(fed.replicate(&msg("sensors/1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_messages_not_replicated() {
        let fed = federation(&["node-b"]).await;
        fed.accept("node-b", event(1, EventPayload::Subscribe(Arc::from("#"))))
            .unwrap();

        let inbound = fed
            .accept("node-b", event(2, EventPayload::Publish(msg("x"))))
            .unwrap()
            .unwrap();
        assert_eq!(inbound.origin_node.as_deref(), Some("node-b"));
        assert!(fed.replicate(&inbound).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_inbound_dropped() {
        let fed = federation(&["node-b"]).await;
        assert!(fed
            .accept("node-b", event(5, EventPayload::Publish(msg("x"))))
            .unwrap()
            .is_some());
        assert!(fed
            .accept("node-b", event(5, EventPayload::Publish(msg("x"))))
            .unwrap()
            .is_none());
        assert!(matches!(
            fed.accept("node-z", event(1, EventPayload::Publish(msg("x")))),
            Err(FederationError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_restarted_peer_log_resets_dedupe() {
        let fed = federation(&["node-b"]).await;
        fed.accept("node-b", event(1, EventPayload::Subscribe(Arc::from("#"))))
            .unwrap();
        for id in 2..=3 {
            assert!(fed
                .accept("node-b", event(id, EventPayload::Publish(msg("x"))))
                .unwrap()
                .is_some());
        }

        // node-b comes back without its stored log and numbers from 1 again
        let restarted = LocalEventLog::new("node-a", Arc::new(NullJournal));
        restarted.open().await.unwrap();
        restarted
            .add(Arc::from("node-b"), EventPayload::Publish(msg("after-restart")))
            .await
            .unwrap();
        let fresh = restarted.try_fetch_events(10).unwrap().remove(0);
        assert_eq!(fresh.id, 1);

        let accepted = fed.accept("node-b", fresh.clone()).unwrap();
        assert_eq!(
            accepted.map(|m| m.payload.clone()),
            Some(bytes::Bytes::from("after-restart"))
        );
        assert!(fed.accept("node-b", fresh).unwrap().is_none());
        // interest from the previous incarnation is dropped
        assert!(fed.replicate(&msg("x")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_interest_advertised_once() {
        let fed = federation(&["node-b"]).await;
        fed.local_subscribe("a/+").await.unwrap();
        fed.local_subscribe("a/+").await.unwrap();
        fed.local_unsubscribe("a/+").await.unwrap();
        assert_eq!(fed.log("node-b").unwrap().len(), 1);
        fed.local_unsubscribe("a/+").await.unwrap();

        let kinds: Vec<&str> = fed
            .log("node-b")
            .unwrap()
            .try_fetch_events(10)
            .unwrap()
            .iter()
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["subscribe", "unsubscribe"]);
    }

    /// Fails the first send, then confirms everything
    struct FlakyLink {
        calls: AtomicUsize,
        delivered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PeerLink for FlakyLink {
        fn peer(&self) -> &str {
            "node-b"
        }

        async fn send(&self, events: &[FederationEvent]) -> Result<u64, FederationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FederationError::Link("connection reset".into()));
            }
            let mut delivered = self.delivered.lock();
            delivered.extend(events.iter().map(|e| e.id));
            Ok(events.last().map_or(0, |e| e.id))
        }
    }

    #[tokio::test]
    async fn test_sender_retries_after_link_error() {
        let fed = federation(&["node-b"]).await;
        fed.accept("node-b", event(1, EventPayload::Subscribe(Arc::from("#"))))
            .unwrap();
        fed.replicate(&msg("a")).await.unwrap();
        fed.replicate(&msg("b")).await.unwrap();

        let link = Arc::new(FlakyLink {
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        fed.spawn_sender(link.clone(), shutdown_tx.subscribe()).unwrap();

        let log = fed.log("node-b").unwrap();
        for _ in 0..100 {
            if log.acked() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(log.acked(), 2);
        assert_eq!(*link.delivered.lock(), vec![1, 2]);

        let _ = shutdown_tx.send(());
        fed.close().await.unwrap();
    }
}
