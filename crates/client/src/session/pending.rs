//! Correlation table between sent requests and their responses.
//!
//! Each outstanding id owns one slot:
//!
//! - `InFlight`: reserved by `send`, nothing received yet
//! - `Waiting`: a caller is suspended in `receive`
//! - `Ready`: the response arrived before anyone asked for it
//!
//! A waiting caller is woken through a oneshot channel, so nothing polls.
//! Only one caller may wait on an id at a time. A caller that times out puts
//! its slot back to `InFlight`, so a late response is still kept for a later
//! `receive`. Slots are removed when their response is consumed or when the
//! table overflows `capacity` (oldest non-waiting slot first).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{Envelope, RequestId};
use tokio::sync::oneshot;

use crate::error::{ClientError, Result};

/// Default bound on outstanding slots.
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Why the table stopped accepting waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The connection failed.
    Disconnected,
    /// The owner closed the session.
    Closed,
}

impl Termination {
    fn to_error(self) -> ClientError {
        match self {
            Termination::Disconnected => ClientError::Disconnected,
            Termination::Closed => ClientError::Closed,
        }
    }
}

type Waiter = oneshot::Sender<Result<Envelope>>;

enum Slot {
    InFlight,
    Waiting(Waiter),
    Ready(Envelope),
}

struct PendingEntry {
    slot: Slot,
    created: Instant,
}

impl PendingEntry {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            created: Instant::now(),
        }
    }
}

/// Outstanding requests of one session.
pub struct PendingTable {
    entries: DashMap<RequestId, PendingEntry>,
    next_id: AtomicU32,
    capacity: usize,
    terminated: OnceLock<Termination>,
}

impl PendingTable {
    /// Creates an empty table holding at most `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU32::new(rand::random()),
            capacity: capacity.max(1),
            terminated: OnceLock::new(),
        }
    }

    /// Allocates an id that is non-zero and not outstanding.
    pub fn reserve(&self) -> RequestId {
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate == 0 {
                continue;
            }
            let id = RequestId(candidate);
            if let Entry::Vacant(vacant) = self.entries.entry(id) {
                vacant.insert(PendingEntry::new(Slot::InFlight));
                break id;
            }
        };
        self.enforce_capacity();
        id
    }

    /// Forgets an id whose request never made it onto the wire.
    pub fn release(&self, id: RequestId) {
        self.entries.remove(&id);
    }

    /// Routes a response to its slot. Returns false if nobody expects it.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        let id = envelope.id();
        let Some(mut entry) = self.entries.get_mut(&id) else {
            tracing::debug!(id = %id, "Dropping response with no outstanding request");
            return false;
        };

        match std::mem::replace(&mut entry.slot, Slot::InFlight) {
            // Sent under the entry lock so a timing-out waiter sees it.
            Slot::Waiting(waiter) => match waiter.send(Ok(envelope)) {
                Ok(()) => {
                    drop(entry);
                    self.entries
                        .remove_if(&id, |_, e| matches!(e.slot, Slot::InFlight));
                }
                Err(returned) => {
                    tracing::debug!(id = %id, "Caller stopped waiting; keeping response");
                    if let Ok(envelope) = returned {
                        entry.slot = Slot::Ready(envelope);
                    }
                }
            },
            Slot::InFlight => entry.slot = Slot::Ready(envelope),
            Slot::Ready(_) => {
                tracing::warn!(id = %id, "Duplicate response replaces an unconsumed one");
                entry.slot = Slot::Ready(envelope);
            }
        }
        true
    }

    /// Waits up to `timeout` for the response to `id` and consumes it.
    pub async fn receive(&self, id: RequestId, timeout: Duration) -> Result<Envelope> {
        let mut rx = match self.register(id) {
            Registration::Ready(envelope) => return Ok(envelope),
            Registration::Failed(err) => return Err(err),
            Registration::Waiting(rx) => rx,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.termination_error()),
            Err(_) => {
                if let Some(mut entry) = self.entries.get_mut(&id) {
                    if matches!(entry.slot, Slot::Waiting(_)) {
                        entry.slot = Slot::InFlight;
                    }
                }
                // The response may have been handed over while the timer fired.
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                tracing::debug!(id = %id, ?timeout, "Timed out waiting for response");
                Err(ClientError::CorrelationTimeout { id, timeout })
            }
        }
    }

    fn register(&self, id: RequestId) -> Registration {
        let terminated = self.terminated.get().copied();
        let registration = match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                match std::mem::replace(&mut occupied.get_mut().slot, Slot::InFlight) {
                    Slot::Ready(envelope) => {
                        occupied.remove();
                        return Registration::Ready(envelope);
                    }
                    Slot::Waiting(waiter) => {
                        occupied.get_mut().slot = Slot::Waiting(waiter);
                        return Registration::Failed(ClientError::AlreadyAwaited { id });
                    }
                    Slot::InFlight => {
                        if let Some(reason) = terminated {
                            occupied.remove();
                            return Registration::Failed(reason.to_error());
                        }
                        let (tx, rx) = oneshot::channel();
                        occupied.get_mut().slot = Slot::Waiting(tx);
                        Registration::Waiting(rx)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if let Some(reason) = terminated {
                    return Registration::Failed(reason.to_error());
                }
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingEntry::new(Slot::Waiting(tx)));
                Registration::Waiting(rx)
            }
        };
        self.enforce_capacity();
        registration
    }

    /// Wakes every waiter with the termination error and drops slots that
    /// can no longer be answered. Responses already received stay readable.
    pub fn fail_all(&self, reason: Termination) {
        if self.terminated.set(reason).is_err() {
            return;
        }

        let mut woken = 0usize;
        self.entries
            .retain(|_, entry| match std::mem::replace(&mut entry.slot, Slot::InFlight) {
                Slot::Waiting(waiter) => {
                    let _ = waiter.send(Err(reason.to_error()));
                    woken += 1;
                    false
                }
                Slot::InFlight => false,
                ready @ Slot::Ready(_) => {
                    entry.slot = ready;
                    true
                }
            });

        tracing::debug!(?reason, woken, "Failed outstanding requests");
    }

    fn termination_error(&self) -> ClientError {
        self.terminated
            .get()
            .copied()
            .unwrap_or(Termination::Disconnected)
            .to_error()
    }

    fn enforce_capacity(&self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|entry| !matches!(entry.slot, Slot::Waiting(_)))
                .min_by_key(|entry| entry.created)
                .map(|entry| *entry.key());

            let Some(id) = oldest else {
                tracing::warn!(
                    outstanding = self.entries.len(),
                    capacity = self.capacity,
                    "Pending table over capacity with every slot awaited"
                );
                return;
            };

            if self
                .entries
                .remove_if(&id, |_, e| !matches!(e.slot, Slot::Waiting(_)))
                .is_some()
            {
                tracing::warn!(id = %id, capacity = self.capacity, "Evicted oldest pending slot");
            }
        }
    }

    /// Number of outstanding slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `id` has a slot.
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("outstanding", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("terminated", &self.terminated.get())
            .finish()
    }
}

enum Registration {
    Ready(Envelope),
    Waiting(oneshot::Receiver<Result<Envelope>>),
    Failed(ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Fields, Response};
    use std::sync::Arc;

    fn response(id: RequestId, tag: &str) -> Envelope {
        let mut fields = Fields::new();
        fields.insert("tag".to_string(), rmpv::Value::from(tag));
        Envelope::Response(Response::new(id, fields))
    }

    fn tag(envelope: &Envelope) -> Option<&str> {
        envelope.fields().get("tag").and_then(|v| v.as_str())
    }

    #[test]
    fn test_reserve_gives_distinct_nonzero_ids() {
        let table = PendingTable::new(1000);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let id = table.reserve();
            assert_ne!(id.value(), 0);
            assert!(seen.insert(id));
        }
        assert_eq!(table.len(), 500);
    }

    #[test]
    fn test_reserve_skips_zero_and_live_ids() {
        let table = PendingTable::new(16);
        table.next_id.store(u32::MAX, Ordering::Relaxed);

        let first = table.reserve();
        assert_eq!(first, RequestId(u32::MAX));

        // Counter wraps to 0, which is skipped.
        let second = table.reserve();
        assert_eq!(second, RequestId(1));

        // Force a collision with a live id.
        table.next_id.store(1, Ordering::Relaxed);
        let third = table.reserve();
        assert_eq!(third, RequestId(2));
    }

    #[tokio::test]
    async fn test_response_before_receive_is_kept() {
        let table = PendingTable::default();
        let id = table.reserve();

        assert!(table.deliver(response(id, "early")));
        let envelope = table.receive(id, Duration::from_secs(1)).await.unwrap();

        assert_eq!(tag(&envelope), Some("early"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_delivery() {
        let table = Arc::new(PendingTable::default());
        let id = table.reserve();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.receive(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.deliver(response(id, "late"));

        let envelope = waiter.await.unwrap().unwrap();
        assert_eq!(tag(&envelope), Some("late"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_receive_times_out_and_keeps_slot() {
        let table = PendingTable::default();
        let id = table.reserve();

        let started = Instant::now();
        let result = table.receive(id, Duration::from_millis(100)).await;

        assert!(matches!(
            result,
            Err(ClientError::CorrelationTimeout { id: timed_out, .. }) if timed_out == id
        ));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(table.contains(id));
    }

    #[tokio::test]
    async fn test_late_response_is_kept_for_retry() {
        let table = PendingTable::default();
        let id = table.reserve();

        let first = table.receive(id, Duration::from_millis(50)).await;
        assert!(matches!(first, Err(ClientError::CorrelationTimeout { .. })));

        assert!(table.deliver(response(id, "late")));
        let retried = table.receive(id, Duration::from_millis(200)).await.unwrap();

        assert_eq!(tag(&retried), Some("late"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_waiter_is_rejected_and_first_still_served() {
        let table = Arc::new(PendingTable::default());
        let id = table.reserve();

        let first = {
            let table = table.clone();
            tokio::spawn(async move { table.receive(id, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = table.receive(id, Duration::from_secs(2)).await;
        assert!(matches!(
            second,
            Err(ClientError::AlreadyAwaited { id: awaited }) if awaited == id
        ));
        assert!(!second.unwrap_err().is_connection_loss());

        table.deliver(response(id, "first"));
        let served = first.await.unwrap().unwrap();
        assert_eq!(tag(&served), Some("first"));
    }

    #[tokio::test]
    async fn test_responses_are_isolated_by_id() {
        let table = Arc::new(PendingTable::default());
        let a = table.reserve();
        let b = table.reserve();

        let wait_a = {
            let table = table.clone();
            tokio::spawn(async move { table.receive(a, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        table.deliver(response(b, "for b"));
        table.deliver(response(a, "for a"));

        assert_eq!(tag(&wait_a.await.unwrap().unwrap()), Some("for a"));
        let got_b = table.receive(b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(tag(&got_b), Some("for b"));
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let table = PendingTable::default();
        assert!(!table.deliver(response(RequestId(77), "stray")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let table = Arc::new(PendingTable::default());
        let waiting = table.reserve();
        let answered = table.reserve();
        let unanswered = table.reserve();
        table.deliver(response(answered, "kept"));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.receive(waiting, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        table.fail_all(Termination::Disconnected);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
        assert!(matches!(result, Err(ClientError::Disconnected)));
        assert!(!table.contains(unanswered));

        // Already-received responses remain readable.
        let kept = table.receive(answered, Duration::from_secs(1)).await.unwrap();
        assert_eq!(tag(&kept), Some("kept"));

        // New waits fail immediately.
        let result = table.receive(unanswered, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn test_fail_all_closed_reports_closed() {
        let table = PendingTable::default();
        let id = table.reserve();
        table.fail_all(Termination::Closed);
        // The first reason wins.
        table.fail_all(Termination::Disconnected);

        let result = table.receive(id, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[test]
    fn test_capacity_evicts_oldest_unawaited() {
        let table = PendingTable::new(2);
        let first = table.reserve();
        std::thread::sleep(Duration::from_millis(2));
        let second = table.reserve();
        std::thread::sleep(Duration::from_millis(2));
        let third = table.reserve();

        assert_eq!(table.len(), 2);
        assert!(!table.contains(first));
        assert!(table.contains(second));
        assert!(table.contains(third));
    }

    #[tokio::test]
    async fn test_capacity_never_evicts_waiters() {
        let table = Arc::new(PendingTable::new(1));
        let awaited = table.reserve();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.receive(awaited, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = table.reserve();
        assert!(table.contains(awaited));
        assert!(!table.contains(other));

        table.deliver(response(awaited, "still here"));
        assert_eq!(tag(&waiter.await.unwrap().unwrap()), Some("still here"));
    }
}
