//! Publish routing
//!
//! One publish is matched once against the subscription index and
//! enqueued per matching subscription. Each enqueue takes only the target
//! session's queue lock.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{Broker, Result};
use crate::federation::{FederationError, FederationEvent};
use crate::persistence::QueueStore;
use crate::protocol::{now_millis, Message, QoS, RetainHandling};
use crate::queue::{DropReason, QueueEntry, QueueError};
use crate::topic::{validate_topic_name, Subscription};

/// What happened to one published message
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions whose filter matched the topic
    pub matched: usize,
    /// Queue entries created
    pub enqueued: usize,
    /// Matches skipped by no-local or because a QoS 0 target is offline
    pub skipped: usize,
    /// Matches refused by a full queue
    pub refused: usize,
    /// Federation peers the message was appended for
    pub replicated: usize,
}

impl Broker {
    /// Publish a server-originated message. Plugins are not consulted.
    pub async fn publish(&self, message: Message) -> Result<PublishReport> {
        self.ensure_running()?;
        validate_topic_name(&message.topic, 0)?;
        self.dispatch(Arc::new(message)).await
    }

    /// Handle an event received from a federation peer. Returns the
    /// dispatch report for publish events seen for the first time.
    pub async fn accept_federated(
        &self,
        peer: &str,
        event: FederationEvent,
    ) -> Result<Option<PublishReport>> {
        self.ensure_running()?;
        let federation = self
            .federation
            .as_ref()
            .ok_or_else(|| FederationError::UnknownPeer(peer.to_string()))?;
        match federation.accept(peer, event)? {
            Some(message) => {
                self.metrics.federation_messages_received_total.inc();
                Ok(Some(self.dispatch(message).await?))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn dispatch(&self, message: Arc<Message>) -> Result<PublishReport> {
        self.metrics.messages_published_total.inc();
        if message.retain {
            self.store_retained(&message).await?;
        }

        let mut report = PublishReport::default();
        let matches = self.subscriptions.matches(&message.topic);
        report.matched = matches.len();
        if matches.is_empty() {
            self.metrics.messages_unrouted_total.inc();
        }

        let mut failure = None;
        for subscription in matches {
            let own = message.origin_node.is_none()
                && message.publisher.as_deref() == Some(subscription.client_id.as_ref());
            if subscription.options.no_local && own {
                report.skipped += 1;
                continue;
            }

            let qos = message.qos.min(subscription.qos());
            if qos == QoS::AtMostOnce && !self.connections.contains_key(&subscription.client_id) {
                trace!(client_id = %subscription.client_id, topic = %message.topic, "QoS 0 for offline session discarded");
                report.skipped += 1;
                continue;
            }

            let retain = subscription.options.retain_as_published && message.retain;
            let entry = QueueEntry::new(message.clone(), qos)
                .with_retain(retain)
                .with_subscription_ids(subscription.subscription_id.into_iter().collect());

            match self.enqueue_for(&subscription.client_id, entry).await {
                Ok(Some(_)) => report.enqueued += 1,
                Ok(None) => {
                    trace!(client_id = %subscription.client_id, "match for a removed session skipped");
                    report.skipped += 1;
                }
                Err(QueueError::Full) => {
                    self.metrics.message_dropped(DropReason::QueueFull);
                    debug!(client_id = %subscription.client_id, topic = %message.topic, "queue full, message refused");
                    report.refused += 1;
                }
                Err(e) => {
                    warn!(client_id = %subscription.client_id, topic = %message.topic, error = %e, "enqueue failed");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(federation) = &self.federation {
            report.replicated = federation.replicate(&message).await?.len();
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// Enqueue for a matched session. `None` if the session was removed
    /// after the match.
    async fn enqueue_for(
        &self,
        client_id: &str,
        entry: QueueEntry,
    ) -> std::result::Result<Option<u64>, QueueError> {
        if let Some(queue) = self.persistence.existing_queue_store(client_id)? {
            return queue.enqueue(entry).await.map(Some);
        }
        if self.sessions.get(client_id).await?.is_none() {
            return Ok(None);
        }
        let queue = self
            .persistence
            .queue_store_or_create(client_id, self.offline_notifier())?;
        let seq = queue.enqueue(entry).await?;
        // purge deletes the session record before the queue; a queue
        // created here after that point is removed again
        if self.sessions.get(client_id).await?.is_none() {
            self.persistence.remove_client(client_id).await?;
            return Ok(None);
        }
        Ok(Some(seq))
    }

    async fn store_retained(&self, message: &Arc<Message>) -> Result<()> {
        if message.clears_retained() {
            self.retained.remove(&message.topic).await?;
        } else {
            self.retained.set(message.clone()).await?;
        }
        self.metrics
            .retained_messages_current
            .set(self.retained.count() as i64);
        Ok(())
    }

    /// Queue retained messages for a new or replaced subscription.
    /// Shared subscriptions never receive retained messages.
    pub(crate) async fn deliver_retained(
        &self,
        subscription: &Subscription,
        is_new: bool,
        queue: &Arc<dyn QueueStore>,
    ) -> Result<usize> {
        if subscription.share_group.is_some() {
            return Ok(0);
        }
        match subscription.options.retain_handling {
            RetainHandling::DoNotSend => return Ok(0),
            RetainHandling::SendAtSubscribeIfNew if !is_new => return Ok(0),
            _ => {}
        }

        let now = now_millis();
        let mut sent = 0;
        for message in self.retained.matching(&subscription.filter) {
            if message.is_expired(now) {
                continue;
            }
            let qos = message.qos.min(subscription.qos());
            let entry = QueueEntry::new(message, qos)
                .with_retain(true)
                .with_subscription_ids(subscription.subscription_id.into_iter().collect());
            match queue.enqueue(entry).await {
                Ok(_) => sent += 1,
                Err(QueueError::Full) => self.metrics.message_dropped(DropReason::QueueFull),
                Err(e) => return Err(e.into()),
            }
        }
        if sent > 0 {
            trace!(client_id = %subscription.client_id, filter = %subscription.filter, sent, "retained messages queued");
        }
        Ok(sent)
    }
}
