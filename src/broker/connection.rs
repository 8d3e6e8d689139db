//! Per-client connection handle
//!
//! The transport owns one [`Connection`] per network connection and feeds
//! it the decoded protocol events of that client. Outbound traffic is
//! pulled with [`Connection::recv`]; the queue notifier wakes it whenever
//! an entry becomes deliverable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{Broker, BrokerError, PublishReport, Result};
use crate::alias::{ConnectionId, OutboundAlias};
use crate::hooks::{ClientInfo, CloseReason};
use crate::metrics::Metrics;
use crate::persistence::{QueueStore, UnackStore};
use crate::protocol::{
    now_millis, Message, QoS, SubscriptionOptions, UserProperty, WillMessage,
};
use crate::queue::{DropReason, QueueEntry, QueueError, QueueNotifier};
use crate::session::UnackState;
use crate::topic::{split_shared, validate_topic_name, Subscription, TopicError};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const TAKEN_OVER: u8 = 2;
const SHUT_DOWN: u8 = 3;

/// Decoded CONNECT as far as the delivery core cares
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub clean_start: bool,
    /// Requested session expiry in seconds. `None` gives non-clean
    /// sessions the configured default and clean ones zero.
    pub session_expiry: Option<u32>,
    pub will: Option<WillMessage>,
    /// Highest alias the client accepts from the broker (0 = none)
    pub topic_alias_maximum: u16,
}

impl ConnectRequest {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            clean_start: true,
            session_expiry: None,
            will: None,
            topic_alias_maximum: 0,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = Some(seconds);
        self
    }

    pub fn will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }
}

/// A PUBLISH ready to be encoded for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Present for QoS 1/2
    pub packet_id: Option<u16>,
    pub topic: Arc<str>,
    /// `New` means send the topic and the alias, `Existing` the alias alone
    pub alias: Option<OutboundAlias>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub subscription_ids: Vec<u32>,
    /// Remaining message expiry in seconds
    pub message_expiry: Option<u32>,
    pub user_properties: Vec<UserProperty>,
}

/// Next packet the transport should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Publish(Delivery),
    /// Resend PUBREL for a QoS 2 delivery awaiting PUBCOMP
    PubRel(u16),
}

/// Result of an inbound PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted(PublishReport),
    /// QoS 2 retransmission of a packet id still awaiting PUBREL
    Duplicate,
}

/// Connection state the broker keeps in its connection map
pub(crate) struct ConnectionShared {
    pub(crate) client: ClientInfo,
    state: AtomicU8,
    ready: Notify,
    redeliver: Mutex<VecDeque<QueueEntry>>,
    pubrel: Mutex<VecDeque<u16>>,
}

impl ConnectionShared {
    pub(crate) fn new(client: ClientInfo) -> Self {
        Self {
            client,
            state: AtomicU8::new(OPEN),
            ready: Notify::new(),
            redeliver: Mutex::new(VecDeque::new()),
            pubrel: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Move out of the open state. Only the first caller wins.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let next = match reason {
            CloseReason::TakenOver => TAKEN_OVER,
            CloseReason::Shutdown => SHUT_DOWN,
            CloseReason::Graceful | CloseReason::Abnormal => CLOSED,
        };
        let won = self
            .state
            .compare_exchange(OPEN, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.ready.notify_one();
        }
        won
    }

    fn check_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            TAKEN_OVER => Err(BrokerError::SessionTakenOver),
            SHUT_DOWN => Err(BrokerError::ShuttingDown),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Queue sweep results waiting for the next `recv`
    pub(crate) fn push_retries(&self, redeliver: Vec<QueueEntry>, pubrel: Vec<u16>) {
        if redeliver.is_empty() && pubrel.is_empty() {
            return;
        }
        self.redeliver.lock().extend(redeliver);
        self.pubrel.lock().extend(pubrel);
        self.ready.notify_one();
    }
}

/// Queue listener wired to a live connection, or to nothing while the
/// session is offline
pub(crate) struct BrokerNotifier {
    conn: Option<Weak<ConnectionShared>>,
    metrics: Metrics,
}

impl BrokerNotifier {
    pub(crate) fn online(conn: &Arc<ConnectionShared>, metrics: Metrics) -> Self {
        Self {
            conn: Some(Arc::downgrade(conn)),
            metrics,
        }
    }

    pub(crate) fn offline(metrics: Metrics) -> Self {
        Self { conn: None, metrics }
    }
}

impl QueueNotifier for BrokerNotifier {
    fn on_ready(&self, client_id: &str) {
        match self.conn.as_ref().and_then(Weak::upgrade) {
            Some(conn) => conn.ready.notify_one(),
            None => trace!(client_id, "entry queued for offline session"),
        }
    }

    fn on_dropped(&self, client_id: &str, entry: &QueueEntry, reason: DropReason) {
        self.metrics.message_dropped(reason);
        debug!(
            client_id,
            topic = %entry.message.topic,
            packet_id = ?entry.packet_id,
            %reason,
            "queue entry dropped"
        );
    }
}

/// Handle for one connected client
pub struct Connection {
    pub(super) broker: Arc<Broker>,
    pub(super) shared: Arc<ConnectionShared>,
    pub(super) queue: Arc<dyn QueueStore>,
    pub(super) unacks: Arc<dyn UnackStore>,
    pub(super) session_present: bool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.shared.client.connection
    }

    pub fn client(&self) -> &ClientInfo {
        &self.shared.client
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.shared.client.client_id
    }

    /// Whether an earlier session was resumed (CONNACK session present)
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Outbound entries currently held for this client, inflight included
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Topic of an inbound PUBLISH after topic alias processing.
    ///
    /// A topic plus an alias (re)registers the alias; an empty topic must
    /// carry an alias registered earlier on this connection.
    pub fn inbound_topic(&self, topic: &str, alias: Option<u16>) -> Result<Arc<str>> {
        let aliases = &self.broker.aliases;
        match (topic.is_empty(), alias) {
            (false, None) => Ok(Arc::from(topic)),
            (false, Some(alias)) => {
                let topic: Arc<str> = Arc::from(topic);
                aliases.register(self.id(), alias, topic.clone())?;
                Ok(topic)
            }
            (true, Some(alias)) => aliases
                .resolve(self.id(), alias)
                .ok_or(BrokerError::InvalidTopic(TopicError::Empty)),
            (true, None) => Err(TopicError::Empty.into()),
        }
    }

    /// Inbound PUBLISH from this client.
    ///
    /// QoS 2 publishes are tracked in the unack store until PUBREL; a
    /// retransmission of a tracked packet id is not dispatched again.
    pub async fn publish(&self, mut message: Message) -> Result<PublishOutcome> {
        self.shared.check_open()?;
        self.broker.ensure_running()?;
        validate_topic_name(&message.topic, 0)?;
        message.publisher = Some(self.client_id().clone());
        message.origin_node = None;

        let broker = &self.broker;
        if let Err(e) = broker.pipeline.msg_arrived(&self.shared.client, &mut message).await {
            broker.metrics.hook_denied("msg_arrived");
            return Err(e.into());
        }

        let exactly_once = match message.packet_id {
            Some(packet_id) if message.qos == QoS::ExactlyOnce => {
                if self.unacks.record(packet_id, UnackState::Received).await? {
                    trace!(client_id = %self.client_id(), packet_id, "duplicate QoS 2 publish");
                    return Ok(PublishOutcome::Duplicate);
                }
                Some(packet_id)
            }
            _ => None,
        };

        match broker.dispatch(Arc::new(message)).await {
            Ok(report) => {
                if let Some(packet_id) = exactly_once {
                    self.unacks.advance(packet_id, UnackState::PubRecSent).await?;
                }
                Ok(PublishOutcome::Accepted(report))
            }
            Err(e) => {
                if let Some(packet_id) = exactly_once {
                    self.unacks.clear(packet_id).await?;
                }
                Err(e)
            }
        }
    }

    /// PUBREL for an inbound QoS 2 publish. Returns false for an unknown
    /// packet id; PUBCOMP is sent either way.
    pub async fn pubrel(&self, packet_id: u16) -> Result<bool> {
        self.shared.check_open()?;
        if self.unacks.get(packet_id).is_none() {
            return Ok(false);
        }
        self.unacks.advance(packet_id, UnackState::PubRelReceived).await?;
        Ok(self.unacks.clear(packet_id).await?)
    }

    /// PUBACK for a QoS 1 delivery. Repeated acks are no-ops.
    pub async fn puback(&self, packet_id: u16) -> Result<bool> {
        self.shared.check_open()?;
        let acked = self.queue.ack(packet_id).await?.is_some();
        if acked {
            self.broker.metrics.messages_acked_total.inc();
        }
        Ok(acked)
    }

    /// PUBREC for a QoS 2 delivery; answer with PUBREL
    pub async fn pubrec(&self, packet_id: u16) -> Result<bool> {
        self.shared.check_open()?;
        match self.queue.release(packet_id).await {
            Ok(()) => Ok(true),
            Err(QueueError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// PUBCOMP for a QoS 2 delivery
    pub async fn pubcomp(&self, packet_id: u16) -> Result<bool> {
        self.puback(packet_id).await
    }

    /// Add or replace a subscription and queue matching retained messages.
    /// Returns the granted QoS.
    pub async fn subscribe(
        &self,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> Result<QoS> {
        self.shared.check_open()?;
        let broker = &self.broker;
        let mut subscription = Subscription::parse(self.client_id().clone(), filter, options)?;
        if let Some(id) = subscription_id {
            subscription = subscription.with_id(id);
        }
        if let Err(e) = broker.pipeline.subscribe(&self.shared.client, &mut subscription).await {
            broker.metrics.hook_denied("subscribe");
            return Err(e.into());
        }

        let is_new = broker.subscriptions.subscribe(subscription.clone()).await?;
        if is_new {
            if let Some(federation) = &broker.federation {
                federation.local_subscribe(&subscription.filter).await?;
            }
        }
        broker
            .metrics
            .subscriptions_current
            .set(broker.subscriptions.count() as i64);

        broker
            .deliver_retained(&subscription, is_new, &self.queue)
            .await?;
        debug!(client_id = %self.client_id(), filter, qos = ?subscription.qos(), "subscribed");
        Ok(subscription.qos())
    }

    /// Returns false if no such subscription existed
    pub async fn unsubscribe(&self, filter: &str) -> Result<bool> {
        self.shared.check_open()?;
        let broker = &self.broker;
        let (group, actual) = match split_shared(filter)? {
            Some((group, actual)) => (Some(group), actual),
            None => (None, filter),
        };
        if let Err(e) = broker.pipeline.unsubscribe(&self.shared.client, filter).await {
            broker.metrics.hook_denied("unsubscribe");
            return Err(e.into());
        }

        let removed = broker
            .subscriptions
            .unsubscribe(self.client_id(), actual, group)
            .await?;
        if removed {
            if let Some(federation) = &broker.federation {
                federation.local_unsubscribe(actual).await?;
            }
        }
        broker
            .metrics
            .subscriptions_current
            .set(broker.subscriptions.count() as i64);
        Ok(removed)
    }

    /// Next packet to send without waiting
    pub async fn try_recv(&self) -> Result<Option<Outbound>> {
        self.shared.check_open()?;

        let pubrel = self.shared.pubrel.lock().pop_front();
        if let Some(packet_id) = pubrel {
            return Ok(Some(Outbound::PubRel(packet_id)));
        }

        loop {
            let retry = self.shared.redeliver.lock().pop_front();
            let Some(packet_id) = retry.and_then(|entry| entry.packet_id) else {
                break;
            };
            match self.queue.mark_inflight(packet_id).await {
                Ok(entry) => {
                    self.broker.metrics.messages_redelivered_total.inc();
                    return Ok(Some(self.delivery(entry)));
                }
                // acknowledged after the sweep picked it
                Err(QueueError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let Some(entry) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        let entry = match entry.packet_id {
            Some(packet_id) if entry.qos.needs_ack() => self.queue.mark_inflight(packet_id).await?,
            _ => entry,
        };
        Ok(Some(self.delivery(entry)))
    }

    /// Wait for the next packet to send. Fails once the connection is
    /// closed, taken over or the broker shuts down.
    pub async fn recv(&self) -> Result<Outbound> {
        loop {
            if let Some(outbound) = self.try_recv().await? {
                return Ok(outbound);
            }
            self.shared.ready.notified().await;
        }
    }

    fn delivery(&self, entry: QueueEntry) -> Outbound {
        let broker = &self.broker;
        broker.metrics.messages_delivered_total.inc();
        let message = &entry.message;
        Outbound::Publish(Delivery {
            packet_id: entry.packet_id.filter(|_| entry.qos.needs_ack()),
            topic: message.topic.clone(),
            alias: broker.aliases.assign(self.id(), &message.topic).ok(),
            payload: message.payload.clone(),
            qos: entry.qos,
            retain: entry.retain,
            dup: entry.dup,
            subscription_ids: entry.subscription_ids.clone(),
            message_expiry: message.remaining_expiry(now_millis()),
            user_properties: message.user_properties.clone(),
        })
    }

    /// End the connection. `Graceful` discards the will; `Abnormal`
    /// publishes it.
    pub async fn close(self, reason: CloseReason) -> Result<()> {
        self.broker.close_connection(&self.shared, reason).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.shared.is_open() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let broker = self.broker.clone();
            let shared = self.shared.clone();
            runtime.spawn(async move {
                if let Err(e) = broker.close_connection(&shared, CloseReason::Abnormal).await {
                    debug!(client_id = %shared.client.client_id, error = %e, "close on drop failed");
                }
            });
        }
    }
}
