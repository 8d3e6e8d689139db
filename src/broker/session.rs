//! Connect, disconnect and session lifetime

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{BrokerNotifier, ConnectionShared};
use super::{Broker, ConnectRequest, Connection, Result};
use crate::hooks::{ClientInfo, CloseReason};
use crate::protocol::{now_millis, WillMessage};
use crate::session::Session;

/// A will waiting out its delay interval
pub(crate) struct PendingWill {
    will: WillMessage,
    handle: JoinHandle<()>,
}

pub(crate) type LifecycleLock = Arc<AsyncMutex<()>>;

/// Held while a client id is attached, torn down or deleted. Attach and
/// teardown of the same client id never interleave.
pub(crate) struct LifecycleGuard<'a> {
    broker: &'a Broker,
    client_id: Arc<str>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // the map holds the only remaining reference once nobody waits
        self.broker
            .lifecycles
            .remove_if(&self.client_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Broker {
    /// Authenticate a client and attach it to its session.
    ///
    /// A client id that is already connected is taken over: the earlier
    /// handle fails with `SessionTakenOver` from then on. Unless the
    /// request asks for a clean start, an unexpired session is resumed with
    /// its subscriptions and queue; inflight deliveries are reset for
    /// redelivery and QoS 2 releases are queued for PUBREL resend.
    pub async fn connect(self: &Arc<Self>, request: ConnectRequest) -> Result<Connection> {
        self.ensure_running()?;
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let client = ClientInfo::new(request.client_id.as_str(), request.username.as_deref(), id);

        if let Err(e) = self
            .pipeline
            .authenticate(&client, request.password.as_deref())
            .await
        {
            self.metrics.hook_denied("auth");
            return Err(e.into());
        }

        let _lifecycle = self.lock_client(&client.client_id).await;
        let shared = Arc::new(ConnectionShared::new(client.clone()));
        if let Some(previous) = self
            .connections
            .insert(client.client_id.clone(), shared.clone())
        {
            info!(client_id = %client.client_id, "session taken over");
            self.metrics.sessions_taken_over_total.inc();
            self.close_connection(&previous, CloseReason::TakenOver).await?;
        }
        self.cancel_will(&client.client_id);

        match self.attach(&shared, &request).await {
            Ok(connection) => {
                self.metrics.client_connected();
                self.pipeline.connected(&client).await;
                info!(
                    client_id = %client.client_id,
                    connection = id,
                    session_present = connection.session_present,
                    "client connected"
                );
                Ok(connection)
            }
            Err(e) => {
                shared.close(CloseReason::Abnormal);
                self.connections
                    .remove_if(&client.client_id, |_, current| Arc::ptr_eq(current, &shared));
                self.aliases.close(id);
                warn!(client_id = %client.client_id, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn attach(self: &Arc<Self>, shared: &Arc<ConnectionShared>, request: &ConnectRequest) -> Result<Connection> {
        let client = &shared.client;
        let client_id = &client.client_id;
        let now = now_millis();
        let expiry = match request.session_expiry {
            Some(requested) => self.config.session.clamp_expiry(requested),
            None if request.clean_start => 0,
            None => self
                .config
                .session
                .clamp_expiry(self.config.session.default_expiry_interval),
        };

        let existing = self.sessions.get(client_id).await?;
        let resumable = existing
            .as_ref()
            .is_some_and(|s| !request.clean_start && !s.is_expired(now));
        if existing.is_some() && !resumable {
            self.purge_session(client_id).await?;
        }

        let session = match existing {
            Some(mut session) if resumable => {
                session.clean_start = false;
                session.expiry_interval = expiry;
                session.username = client.username.clone();
                session.will = request.will.clone();
                session.mark_connected(now);
                session
            }
            _ => {
                let mut session = Session::new(client_id.clone(), request.clean_start, expiry, now);
                session.username = client.username.clone();
                session.will = request.will.clone();
                self.metrics.sessions_current.inc();
                session
            }
        };
        self.sessions.create(session).await?;

        let notifier = Arc::new(BrokerNotifier::online(shared, self.metrics.clone()));
        let queue = self.persistence.queue_store(client_id, notifier)?;
        queue.init(!resumable).await?;
        let unacks = self.persistence.unack_store(client_id)?;
        unacks.init(!resumable).await?;
        shared.push_retries(Vec::new(), queue.released().await);

        self.aliases.open(
            client.connection,
            self.config.session.max_topic_aliases,
            request.topic_alias_maximum,
        );

        Ok(Connection {
            broker: self.clone(),
            shared: shared.clone(),
            queue,
            unacks,
            session_present: resumable,
        })
    }

    pub(crate) async fn lock_client(&self, client_id: &Arc<str>) -> LifecycleGuard<'_> {
        let lock = self.lifecycles.entry(client_id.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        LifecycleGuard {
            broker: self,
            client_id: client_id.clone(),
            guard: Some(guard),
        }
    }

    /// Tear down one connection. Only the first call for a connection does
    /// anything.
    pub(crate) async fn close_connection(
        self: &Arc<Self>,
        shared: &Arc<ConnectionShared>,
        reason: CloseReason,
    ) -> Result<()> {
        if !shared.close(reason) {
            return Ok(());
        }
        if reason == CloseReason::TakenOver {
            // `connect` holds the lifecycle lock and keeps the session
            self.detach(shared);
            self.pipeline.closed(&shared.client, reason).await;
            return Ok(());
        }
        let _lifecycle = self.lock_client(&shared.client.client_id).await;
        self.finish_close(shared, reason).await
    }

    fn detach(&self, shared: &Arc<ConnectionShared>) {
        let client = &shared.client;
        self.connections
            .remove_if(&client.client_id, |_, current| Arc::ptr_eq(current, shared));
        self.aliases.close(client.connection);
        self.metrics.client_disconnected();
    }

    /// Second half of a close, run under the client's lifecycle lock
    pub(crate) async fn finish_close(
        self: &Arc<Self>,
        shared: &Arc<ConnectionShared>,
        reason: CloseReason,
    ) -> Result<()> {
        let client = &shared.client;
        self.detach(shared);
        let ended = if self.connections.contains_key(&client.client_id) {
            // a newer connection attached while this one was closing
            debug!(client_id = %client.client_id, "session kept for newer connection");
            Ok(())
        } else {
            self.end_session(client, reason).await
        };
        self.pipeline.closed(client, reason).await;
        debug!(client_id = %client.client_id, connection = client.connection, ?reason, "connection closed");
        ended
    }

    async fn end_session(self: &Arc<Self>, client: &ClientInfo, reason: CloseReason) -> Result<()> {
        let client_id = &client.client_id;
        let Some(mut session) = self.sessions.get(client_id).await? else {
            return Ok(());
        };
        let will = session
            .will
            .take()
            .filter(|_| reason == CloseReason::Abnormal);

        if !session.is_persistent() {
            if let Some(will) = will {
                self.publish_will(client_id, &will).await;
            }
            self.purge_session(client_id).await?;
            return Ok(());
        }

        session.mark_disconnected(now_millis());
        let expiry = session.expiry_interval;
        self.sessions.create(session).await?;
        // keep queueing while offline, without waking the old handle
        self.persistence
            .queue_store(client_id, self.offline_notifier())?;

        if let Some(will) = will {
            let delay = will.delay_interval.min(expiry);
            if delay == 0 {
                self.publish_will(client_id, &will).await;
            } else {
                self.schedule_will(client_id.clone(), will, delay);
            }
        }
        Ok(())
    }

    fn schedule_will(self: &Arc<Self>, client_id: Arc<str>, will: WillMessage, delay: u32) {
        let broker = Arc::downgrade(self);
        let key = client_id.clone();
        let message = will.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(delay))).await;
            let Some(broker) = broker.upgrade() else {
                return;
            };
            if broker.pending_wills.remove(&key).is_some() {
                broker.publish_will(&key, &message).await;
            }
        });
        debug!(client_id = %client_id, delay, "will scheduled");
        self.pending_wills.insert(client_id, PendingWill { will, handle });
    }

    /// Drop a delayed will because its client came back
    pub(crate) fn cancel_will(&self, client_id: &str) {
        if let Some((_, pending)) = self.pending_wills.remove(client_id) {
            pending.handle.abort();
            debug!(client_id, "pending will cancelled");
        }
    }

    pub(crate) fn abort_wills(&self) {
        let keys: Vec<Arc<str>> = self.pending_wills.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel_will(&key);
        }
    }

    async fn publish_will(&self, client_id: &str, will: &WillMessage) {
        let message = Arc::new(will.to_message(client_id));
        match self.dispatch(message).await {
            Ok(report) => debug!(client_id, topic = %will.topic, matched = report.matched, "will published"),
            Err(e) => warn!(client_id, topic = %will.topic, error = %e, "will publish failed"),
        }
    }

    /// Delete a session with its subscriptions, queue and unack state.
    /// A will still waiting out its delay is published first.
    pub(crate) async fn purge_session(&self, client_id: &str) -> Result<bool> {
        if let Some((_, pending)) = self.pending_wills.remove(client_id) {
            pending.handle.abort();
            self.publish_will(client_id, &pending.will).await;
        }

        let removed = self.subscriptions.unsubscribe_all(client_id).await?;
        if let Some(federation) = &self.federation {
            for subscription in &removed {
                federation.local_unsubscribe(&subscription.filter).await?;
            }
        }
        // session record first: a racing enqueue that sees it gone cleans up
        let existed = self.sessions.delete(client_id).await?;
        let swept = self.persistence.unack_store(client_id)?.sweep().await?;
        self.persistence.remove_client(client_id).await?;
        if existed {
            self.metrics.sessions_current.dec();
        }
        self.metrics
            .subscriptions_current
            .set(self.subscriptions.count() as i64);
        debug!(
            client_id,
            subscriptions = removed.len(),
            unacks = swept.len(),
            "session removed"
        );
        Ok(existed)
    }

    /// Remove disconnected sessions whose expiry interval elapsed
    pub async fn expire_sessions(&self) -> Result<usize> {
        let now = now_millis();
        let mut expired = 0;
        for session in self.sessions.list().await? {
            if !session.is_expired(now) || self.connections.contains_key(&session.client_id) {
                continue;
            }
            let _lifecycle = self.lock_client(&session.client_id).await;
            let still_expired = self
                .sessions
                .get(&session.client_id)
                .await?
                .is_some_and(|s| s.is_expired(now));
            if !still_expired || self.connections.contains_key(&session.client_id) {
                continue;
            }
            if self.purge_session(&session.client_id).await? {
                self.metrics.sessions_expired_total.inc();
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "expired sessions removed");
        }
        Ok(expired)
    }

    /// Delete a session on administrative request. A connected client is
    /// disconnected first.
    pub async fn delete_session(self: &Arc<Self>, client_id: &str) -> Result<bool> {
        let client_id: Arc<str> = Arc::from(client_id);
        let _lifecycle = self.lock_client(&client_id).await;
        let existed = self.sessions.get(&client_id).await?.is_some();
        let connected = self.connections.get(&client_id).map(|e| e.value().clone());
        if let Some(shared) = connected {
            if shared.close(CloseReason::Graceful) {
                self.finish_close(&shared, CloseReason::Graceful).await?;
            }
        }
        let purged = self.purge_session(&client_id).await?;
        Ok(existed || purged)
    }
}
