//! Outbound queue state machine
//!
//! Entries are kept in sequence order in a `VecDeque`; a side index maps
//! packet ids to sequence numbers so acknowledgements do not scan. All
//! operations take the current time in unix milliseconds so sweeps and
//! tests are deterministic.

use std::collections::VecDeque;

use ahash::AHashMap;

use super::{
    DropReason, EntryState, ExpiryAction, FullPolicy, QueueEntry, QueueError, QueueSettings,
};

/// Result of a successful enqueue
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub seq: u64,
    /// Oldest queued entry evicted to make room, if any
    pub evicted: Option<QueueEntry>,
}

/// Result of a dequeue attempt
#[derive(Debug, Default)]
pub struct Dequeued {
    /// Next entry to transmit. QoS 0 entries are already removed from the
    /// queue; QoS 1/2 entries are now inflight with a packet id.
    pub entry: Option<QueueEntry>,
    /// Entries skipped because their message expired
    pub expired: Vec<QueueEntry>,
}

/// Result of an inflight expiry sweep
#[derive(Debug, Default)]
pub struct ExpireReport {
    /// Entries to transmit again with DUP set
    pub redeliver: Vec<QueueEntry>,
    /// QoS 2 packet ids whose PUBREL should be sent again
    pub resend_pubrel: Vec<u16>,
    pub dropped: Vec<(QueueEntry, DropReason)>,
}

impl ExpireReport {
    pub fn is_empty(&self) -> bool {
        self.redeliver.is_empty() && self.resend_pubrel.is_empty() && self.dropped.is_empty()
    }
}

/// One session's queue and inflight window
#[derive(Debug)]
pub struct OutboundQueue {
    settings: QueueSettings,
    entries: VecDeque<QueueEntry>,
    /// packet id -> seq for every entry holding a packet id
    packet_index: AHashMap<u16, u64>,
    next_seq: u64,
    last_packet_id: u16,
    /// Entries currently inflight or released
    window: usize,
}

impl OutboundQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            entries: VecDeque::new(),
            packet_index: AHashMap::new(),
            next_seq: 1,
            last_packet_id: 0,
            window: 0,
        }
    }

    /// Rebuild a queue from stored entries, e.g. after a restart
    pub fn restore(settings: QueueSettings, entries: impl IntoIterator<Item = QueueEntry>) -> Self {
        let mut sorted: Vec<QueueEntry> = entries.into_iter().collect();
        sorted.sort_by_key(|e| e.seq);

        let mut queue = Self::new(settings);
        for entry in sorted {
            if let Some(pid) = entry.packet_id {
                queue.packet_index.insert(pid, entry.seq);
                queue.last_packet_id = queue.last_packet_id.max(pid);
            }
            if entry.in_window() {
                queue.window += 1;
            }
            queue.next_seq = entry.seq + 1;
            queue.entries.push_back(entry);
        }
        queue
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries occupying the inflight window
    pub fn inflight_len(&self) -> usize {
        self.window
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// True if an entry is waiting and the window has room for it
    pub fn has_deliverable(&self) -> bool {
        self.entries.iter().any(|e| {
            e.state == EntryState::Queued
                && (!e.qos.needs_ack() || self.window < self.settings.max_inflight)
        })
    }

    pub fn get(&self, seq: u64) -> Option<&QueueEntry> {
        let idx = self.entries.binary_search_by_key(&seq, |e| e.seq).ok()?;
        self.entries.get(idx)
    }

    /// Remove an entry by sequence number regardless of its state
    pub fn remove(&mut self, seq: u64) -> Option<QueueEntry> {
        let idx = self.entries.binary_search_by_key(&seq, |e| e.seq).ok()?;
        self.remove_at(idx)
    }

    /// Put a removed entry back at its sequence position
    pub fn reinsert(&mut self, entry: QueueEntry) {
        let idx = self.entries.partition_point(|e| e.seq < entry.seq);
        if let Some(pid) = entry.packet_id {
            self.packet_index.insert(pid, entry.seq);
        }
        if entry.in_window() {
            self.window += 1;
        }
        self.entries.insert(idx, entry);
    }

    fn expiry_ms(&self) -> u64 {
        self.settings.inflight_expiry.as_millis() as u64
    }

    fn index_of_packet(&self, packet_id: u16) -> Option<usize> {
        let seq = *self.packet_index.get(&packet_id)?;
        self.entries.binary_search_by_key(&seq, |e| e.seq).ok()
    }

    fn remove_at(&mut self, idx: usize) -> Option<QueueEntry> {
        let entry = self.entries.remove(idx)?;
        if let Some(pid) = entry.packet_id {
            self.packet_index.remove(&pid);
        }
        if entry.in_window() {
            self.window -= 1;
        }
        Some(entry)
    }

    fn allocate_packet_id(&mut self) -> Result<u16, QueueError> {
        if self.packet_index.len() >= usize::from(u16::MAX) {
            return Err(QueueError::PacketIdsExhausted);
        }
        loop {
            self.last_packet_id = self.last_packet_id.checked_add(1).unwrap_or(1);
            if !self.packet_index.contains_key(&self.last_packet_id) {
                return Ok(self.last_packet_id);
            }
        }
    }

    /// Append an entry, applying the full policy at capacity
    pub fn enqueue(&mut self, mut entry: QueueEntry, now: u64) -> Result<EnqueueOutcome, QueueError> {
        let mut evicted = None;
        if self.settings.max_queued > 0 && self.entries.len() >= self.settings.max_queued {
            if self.settings.full_policy == FullPolicy::Reject {
                return Err(QueueError::Full);
            }
            let oldest = self
                .entries
                .iter()
                .position(|e| e.state == EntryState::Queued)
                .ok_or(QueueError::Full)?;
            evicted = self.remove_at(oldest);
        }

        entry.seq = self.next_seq;
        entry.state = EntryState::Queued;
        entry.packet_id = None;
        entry.dup = false;
        entry.attempts = 0;
        entry.deadline = None;
        entry.enqueued_at = now;
        self.next_seq += 1;
        self.entries.push_back(entry);

        Ok(EnqueueOutcome {
            seq: self.next_seq - 1,
            evicted,
        })
    }

    /// Take the next deliverable entry.
    ///
    /// Entries are handed out strictly in queue order: when the window is
    /// full nothing behind the blocked entry is returned either.
    pub fn dequeue(&mut self, now: u64) -> Result<Dequeued, QueueError> {
        let mut out = Dequeued::default();
        let mut idx = 0;
        while idx < self.entries.len() {
            let (state, expired, needs_ack, packet_id) = {
                let e = &self.entries[idx];
                (e.state, e.message.is_expired(now), e.qos.needs_ack(), e.packet_id)
            };
            if state != EntryState::Queued {
                idx += 1;
                continue;
            }
            if expired {
                out.expired.extend(self.remove_at(idx));
                continue;
            }
            if !needs_ack {
                out.entry = self.remove_at(idx);
                return Ok(out);
            }
            if self.window >= self.settings.max_inflight {
                break;
            }

            let pid = match packet_id {
                Some(pid) => pid,
                None => self.allocate_packet_id()?,
            };
            let deadline = now + self.expiry_ms();
            let entry = &mut self.entries[idx];
            entry.packet_id = Some(pid);
            entry.state = EntryState::Inflight;
            entry.deadline = Some(deadline);
            let seq = entry.seq;
            out.entry = Some(entry.clone());
            self.packet_index.insert(pid, seq);
            self.window += 1;
            return Ok(out);
        }
        Ok(out)
    }

    /// Record a transmission of an inflight entry, re-arming its deadline
    pub fn mark_inflight(&mut self, packet_id: u16, now: u64) -> Result<QueueEntry, QueueError> {
        let deadline = now + self.expiry_ms();
        let idx = self
            .index_of_packet(packet_id)
            .ok_or(QueueError::NotFound(packet_id))?;
        let entry = &mut self.entries[idx];
        if entry.state != EntryState::Inflight {
            return Err(QueueError::NotFound(packet_id));
        }
        entry.attempts += 1;
        entry.dup = entry.dup || entry.attempts > 1;
        entry.deadline = Some(deadline);
        Ok(entry.clone())
    }

    /// QoS 2: PUBREC received. Repeated PUBRECs are accepted.
    pub fn release(&mut self, packet_id: u16, now: u64) -> Result<QueueEntry, QueueError> {
        let deadline = now + self.expiry_ms();
        let idx = self
            .index_of_packet(packet_id)
            .ok_or(QueueError::NotFound(packet_id))?;
        let entry = &mut self.entries[idx];
        match entry.state {
            EntryState::Inflight if entry.qos == crate::protocol::QoS::ExactlyOnce => {
                entry.state = EntryState::Released;
                entry.deadline = Some(deadline);
                Ok(entry.clone())
            }
            EntryState::Released => Ok(entry.clone()),
            _ => Err(QueueError::NotFound(packet_id)),
        }
    }

    /// Final acknowledgement (PUBACK or PUBCOMP). Unknown ids are ignored.
    pub fn ack(&mut self, packet_id: u16) -> Option<QueueEntry> {
        let idx = self.index_of_packet(packet_id)?;
        self.remove_at(idx)
    }

    /// Sweep inflight deadlines and message expiry
    pub fn expire(&mut self, now: u64) -> ExpireReport {
        let mut report = ExpireReport::default();
        let expiry = self.expiry_ms();
        let mut idx = 0;
        while idx < self.entries.len() {
            let entry = &mut self.entries[idx];
            let overdue = entry.deadline.is_some_and(|d| d <= now);
            let reason = match entry.state {
                EntryState::Queued if entry.message.is_expired(now) => Some(DropReason::Expired),
                EntryState::Inflight if overdue => {
                    if self.settings.expiry_action == ExpiryAction::Drop {
                        Some(DropReason::InflightExpired)
                    } else if self.settings.max_attempts > 0
                        && entry.attempts >= self.settings.max_attempts
                    {
                        Some(DropReason::MaxAttempts)
                    } else {
                        entry.dup = true;
                        entry.deadline = Some(now + expiry);
                        report.redeliver.push(entry.clone());
                        None
                    }
                }
                EntryState::Released if overdue => {
                    entry.deadline = Some(now + expiry);
                    report.resend_pubrel.extend(entry.packet_id);
                    None
                }
                _ => None,
            };
            match reason {
                Some(reason) => {
                    if let Some(dropped) = self.remove_at(idx) {
                        report.dropped.push((dropped, reason));
                    }
                }
                None => idx += 1,
            }
        }
        report
    }

    /// Prepare a persistent session's queue for a new connection.
    ///
    /// QoS 0 entries are discarded. Inflight entries go back to queued with
    /// DUP set, keeping their packet id and position. Released entries stay
    /// in the window for PUBREL resend.
    pub fn resume(&mut self) -> Vec<QueueEntry> {
        let mut discarded = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            let entry = &mut self.entries[idx];
            if !entry.qos.needs_ack() {
                discarded.extend(self.remove_at(idx));
                continue;
            }
            if entry.state == EntryState::Inflight {
                entry.state = EntryState::Queued;
                entry.dup = true;
                entry.deadline = None;
                self.window -= 1;
            }
            idx += 1;
        }
        discarded
    }

    /// Packet ids awaiting PUBCOMP
    pub fn released(&self) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Released)
            .filter_map(|e| e.packet_id)
            .collect()
    }

    pub fn clear(&mut self) -> Vec<QueueEntry> {
        self.packet_index.clear();
        self.window = 0;
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, QoS};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(max_queued: usize, max_inflight: usize) -> QueueSettings {
        QueueSettings {
            max_queued,
            max_inflight,
            inflight_expiry: Duration::from_millis(100),
            ..QueueSettings::default()
        }
    }

    fn entry(payload: &'static str, qos: QoS) -> QueueEntry {
        QueueEntry::new(Arc::new(Message::new("t", payload, qos).with_created_at(0)), qos)
    }

    fn payload(e: &QueueEntry) -> &[u8] {
        &e.message.payload
    }

    #[test]
    fn test_fifo_and_window() {
        let mut q = OutboundQueue::new(settings(0, 2));
        for p in ["a", "b", "c"] {
            q.enqueue(entry(p, QoS::AtLeastOnce), 0).unwrap();
        }

        let a = q.dequeue(0).unwrap().entry.unwrap();
        let b = q.dequeue(0).unwrap().entry.unwrap();
        assert_eq!(payload(&a), b"a");
        assert_eq!(payload(&b), b"b");
        assert_ne!(a.packet_id, b.packet_id);
        assert!(q.dequeue(0).unwrap().entry.is_none());
        assert!(!q.has_deliverable());

        q.ack(a.packet_id.unwrap());
        assert_eq!(payload(&q.dequeue(0).unwrap().entry.unwrap()), b"c");
        assert_eq!(q.inflight_len(), 2);
    }

    #[test]
    fn test_qos0_removed_on_dequeue() {
        let mut q = OutboundQueue::new(settings(0, 1));
        q.enqueue(entry("x", QoS::AtMostOnce), 0).unwrap();
        let got = q.dequeue(0).unwrap().entry.unwrap();
        assert_eq!(got.packet_id, None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_double_ack_is_noop() {
        let mut q = OutboundQueue::new(settings(0, 4));
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let a = q.dequeue(0).unwrap().entry.unwrap();
        let pid = a.packet_id.unwrap();

        assert!(q.ack(pid).is_some());
        assert!(q.ack(pid).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.inflight_len(), 0);
    }

    #[test]
    fn test_drop_oldest_never_exceeds_depth() {
        let mut q = OutboundQueue::new(settings(2, 4));
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let inflight = q.dequeue(0).unwrap().entry.unwrap();
        assert_eq!(payload(&inflight), b"a");

        let outcome = q.enqueue(entry("c", QoS::AtLeastOnce), 0).unwrap();
        assert_eq!(payload(&outcome.evicted.unwrap()), b"b");
        assert_eq!(q.len(), 2);

        // Only inflight entries left to evict: the queue refuses.
        q.dequeue(0).unwrap();
        assert!(matches!(
            q.enqueue(entry("d", QoS::AtLeastOnce), 0),
            Err(QueueError::Full)
        ));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_reject_policy() {
        let mut s = settings(1, 4);
        s.full_policy = FullPolicy::Reject;
        let mut q = OutboundQueue::new(s);
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        assert!(matches!(
            q.enqueue(entry("b", QoS::AtLeastOnce), 0),
            Err(QueueError::Full)
        ));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_expire_redeliver_then_max_attempts() {
        let mut s = settings(0, 4);
        s.max_attempts = 2;
        let mut q = OutboundQueue::new(s);
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        let pid = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();
        q.mark_inflight(pid, 0).unwrap();

        assert!(q.expire(50).is_empty());
        let report = q.expire(100);
        assert_eq!(report.redeliver.len(), 1);
        assert!(report.redeliver[0].dup);

        let resent = q.mark_inflight(pid, 100).unwrap();
        assert_eq!(resent.attempts, 2);
        let report = q.expire(200);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].1, DropReason::MaxAttempts);
        assert!(q.is_empty());
    }

    #[test]
    fn test_expire_drop_action() {
        let mut s = settings(0, 4);
        s.expiry_action = ExpiryAction::Drop;
        let mut q = OutboundQueue::new(s);
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.dequeue(0).unwrap();
        let report = q.expire(100);
        assert_eq!(report.dropped[0].1, DropReason::InflightExpired);
        assert_eq!(q.inflight_len(), 0);
    }

    #[test]
    fn test_message_expiry_skipped_on_dequeue() {
        let mut q = OutboundQueue::new(settings(0, 4));
        let stale = QueueEntry::new(
            Arc::new(Message::new("t", "old", QoS::AtLeastOnce).with_created_at(0).with_expiry(1)),
            QoS::AtLeastOnce,
        );
        q.enqueue(stale, 0).unwrap();
        q.enqueue(entry("fresh", QoS::AtLeastOnce), 0).unwrap();

        let out = q.dequeue(5_000).unwrap();
        assert_eq!(out.expired.len(), 1);
        assert_eq!(payload(&out.entry.unwrap()), b"fresh");
    }

    #[test]
    fn test_qos2_release_flow() {
        let mut q = OutboundQueue::new(settings(0, 4));
        q.enqueue(entry("a", QoS::ExactlyOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let a = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();
        let b = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();

        assert!(matches!(q.release(b, 0), Err(QueueError::NotFound(_))));
        assert_eq!(q.release(a, 0).unwrap().state, EntryState::Released);
        assert!(q.release(a, 0).is_ok());
        assert_eq!(q.released(), vec![a]);
        assert_eq!(q.expire(100).resend_pubrel, vec![a]);

        q.ack(a);
        assert!(q.released().is_empty());
    }

    #[test]
    fn test_resume_keeps_order_and_packet_ids() {
        let mut q = OutboundQueue::new(settings(0, 4));
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtMostOnce), 0).unwrap();
        q.enqueue(entry("c", QoS::AtLeastOnce), 0).unwrap();
        let a = q.dequeue(0).unwrap().entry.unwrap();

        let discarded = q.resume();
        assert_eq!(discarded.len(), 1);
        assert_eq!(q.inflight_len(), 0);

        let again = q.dequeue(0).unwrap().entry.unwrap();
        assert_eq!(payload(&again), b"a");
        assert!(again.dup);
        assert_eq!(again.packet_id, a.packet_id);
        assert_eq!(payload(&q.dequeue(0).unwrap().entry.unwrap()), b"c");
    }

    #[test]
    fn test_restore_rebuilds_index() {
        let mut q = OutboundQueue::new(settings(0, 4));
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let pid = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();

        let mut stored: Vec<QueueEntry> = q.entries().cloned().collect();
        stored.reverse();
        let mut restored = OutboundQueue::restore(settings(0, 4), stored);
        assert_eq!(restored.inflight_len(), 1);
        assert!(restored.ack(pid).is_some());
        let next = restored.enqueue(entry("c", QoS::AtLeastOnce), 0).unwrap();
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn test_packet_ids_skip_in_use() {
        let mut q = OutboundQueue::new(settings(0, 4));
        q.last_packet_id = u16::MAX - 1;
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let a = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();
        let b = q.dequeue(0).unwrap().entry.unwrap().packet_id.unwrap();
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_reinsert_restores_eviction() {
        let mut q = OutboundQueue::new(settings(2, 4));
        q.enqueue(entry("a", QoS::AtLeastOnce), 0).unwrap();
        q.enqueue(entry("b", QoS::AtLeastOnce), 0).unwrap();
        let outcome = q.enqueue(entry("c", QoS::AtLeastOnce), 0).unwrap();

        q.remove(outcome.seq);
        q.reinsert(outcome.evicted.unwrap());
        let order: Vec<&[u8]> = q.entries().map(payload).collect();
        assert_eq!(order, vec![b"a".as_slice(), b"b".as_slice()]);
        assert_eq!(payload(&q.dequeue(0).unwrap().entry.unwrap()), b"a");
    }
}
