//! Background timers: queue sweep, session expiry and persistence flush

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Broker, Result};

pub(super) fn spawn(broker: &Arc<Broker>) -> Vec<JoinHandle<()>> {
    let config = &broker.config;
    vec![
        every(broker, "queue_sweep", config.queue.sweep_interval, |b| async move {
            b.sweep_queues().await;
        }),
        every(
            broker,
            "session_expiry",
            config.session.expiry_check_interval_duration(),
            |b| async move {
                if let Err(e) = b.expire_sessions().await {
                    warn!(error = %e, "session expiry sweep failed");
                }
            },
        ),
        every(
            broker,
            "persistence_flush",
            config.persistence.flush_interval,
            |b| async move {
                if let Err(e) = b.persistence.flush().await {
                    warn!(error = %e, "persistence flush failed");
                }
            },
        ),
    ]
}

fn every<F, Fut>(broker: &Arc<Broker>, name: &'static str, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn(Arc<Broker>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let broker = broker.clone();
    let mut shutdown = broker.shutdown.subscribe();
    let period = period.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;

                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => task(broker.clone()).await,
            }
        }
        debug!(timer = name, "timer stopped");
    })
}

impl Broker {
    /// Run the inflight and message expiry sweep over every connected
    /// client's queue and hand redeliveries to their connections
    pub async fn sweep_queues(&self) {
        let online: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for shared in online {
            let client_id = &shared.client.client_id;
            if let Err(e) = self.sweep_queue(client_id, &shared).await {
                warn!(%client_id, error = %e, "queue sweep failed");
            }
        }
    }

    async fn sweep_queue(&self, client_id: &str, shared: &super::connection::ConnectionShared) -> Result<()> {
        let Some(queue) = self.persistence.existing_queue_store(client_id)? else {
            return Ok(());
        };
        let report = queue.expire().await?;
        shared.push_retries(report.redeliver, report.resend_pubrel);
        Ok(())
    }
}
