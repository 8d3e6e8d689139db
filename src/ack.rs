//! Request/response correlation for asynchronous acknowledgements
//!
//! A caller that needs an answer from outside the broker (a device driver
//! deciding on a login, for instance) registers a slot in an [`AckTable`],
//! hands the id to whoever will answer, and waits on the returned
//! [`PendingAck`]. Every slot ends exactly once: completed, cancelled or
//! timed out. The transition is a compare-and-set on the slot state, so a
//! late answer after a timeout is rejected instead of delivered.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;
const TIMED_OUT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckError {
    /// No answer before the deadline
    Timeout,
    /// The waiter's connection went away or the slot was cancelled
    Cancelled,
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "acknowledgement timed out"),
            Self::Cancelled => write!(f, "acknowledgement cancelled"),
        }
    }
}

impl std::error::Error for AckError {}

struct Slot<T> {
    state: AtomicU8,
    owner: Option<Arc<str>>,
    deadline: Instant,
    tx: Mutex<Option<oneshot::Sender<Result<T, AckError>>>>,
}

impl<T> Slot<T> {
    /// Move out of PENDING. Only the winning caller may send.
    fn finish(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn send(&self, result: Result<T, AckError>) {
        if let Some(tx) = self.tx.lock().take() {
            // The waiter may already be gone
            let _ = tx.send(result);
        }
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// Handle held by the waiting side
pub struct PendingAck<T> {
    id: u64,
    slot: Arc<Slot<T>>,
    rx: oneshot::Receiver<Result<T, AckError>>,
}

impl<T> PendingAck<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the answer, at most until the slot deadline or `timeout`,
    /// whichever comes first
    pub async fn wait(mut self, timeout: Duration) -> Result<T, AckError> {
        let until = self.slot.deadline.min(Instant::now() + timeout);
        match tokio::time::timeout_at(until, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AckError::Cancelled),
            Err(_) if self.slot.finish(TIMED_OUT) => Err(AckError::Timeout),
            // Finished concurrently; the winner is about to send
            Err(_) => self.rx.await.unwrap_or(Err(AckError::Cancelled)),
        }
    }
}

/// Outstanding requests keyed by id
pub struct AckTable<T> {
    slots: DashMap<u64, Arc<Slot<T>>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl<T: Send + 'static> AckTable<T> {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a slot with the default deadline
    pub fn register(&self, owner: Option<&str>) -> PendingAck<T> {
        self.register_with_timeout(owner, self.default_timeout)
    }

    /// Open a slot that expires after `timeout`. `owner` groups slots for
    /// [`cancel_owner`](Self::cancel_owner).
    pub fn register_with_timeout(&self, owner: Option<&str>, timeout: Duration) -> PendingAck<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Slot {
            state: AtomicU8::new(PENDING),
            owner: owner.map(Arc::from),
            deadline: Instant::now() + timeout,
            tx: Mutex::new(Some(tx)),
        });
        self.slots.insert(id, slot.clone());
        trace!(id, "ack slot registered");
        PendingAck { id, slot, rx }
    }

    /// Deliver an answer. False if the slot is unknown or already finished.
    pub fn complete(&self, id: u64, value: T) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        if !slot.finish(COMPLETED) {
            return false;
        }
        slot.send(Ok(value));
        true
    }

    pub fn cancel(&self, id: u64) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        if !slot.finish(CANCELLED) {
            return false;
        }
        slot.send(Err(AckError::Cancelled));
        true
    }

    /// Cancel every pending slot registered by `owner`
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|s| s.value().owner.as_deref() == Some(owner))
            .map(|s| *s.key())
            .collect();
        let cancelled = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if cancelled > 0 {
            debug!(owner, cancelled, "pending acks cancelled");
        }
        cancelled
    }

    /// Time out overdue slots and drop finished ones. Returns how many
    /// timed out.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let mut timed_out = 0;
        self.slots.retain(|_, slot| {
            if !slot.is_pending() {
                return false;
            }
            if slot.deadline > now {
                return true;
            }
            if slot.finish(TIMED_OUT) {
                slot.send(Err(AckError::Timeout));
                timed_out += 1;
            }
            false
        });
        if timed_out > 0 {
            debug!(timed_out, "pending acks timed out");
        }
        timed_out
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run [`reap`](Self::reap) every `interval` until shutdown
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        table.reap();
                    }
                    _ = shutdown.recv() => {
                        debug!("ack reaper stopping");
                        break;
                    }
                }
            }
        })
    }
}
