//! Sequence-number-indexed segment store.
//!
//! [`SequencedStore`] backs three per-connection buffers:
//! - the **outbound queue** of data segments waiting for the send loop,
//! - the **resend store** of written-but-unacknowledged data segments,
//! - the **reorder store** of inbound segments that arrived ahead of a gap.
//!
//! Every entry remembers when it was inserted.  Reads either block until the
//! lowest-numbered entry can be taken ([`SequencedStore::consume_oldest`]) or
//! sweep every entry past a given age ([`SequencedStore::consume_older_than`]).
//!
//! All methods take `&self`; one internal mutex guards the map and is never
//! held across an `.await`.
//!
//! Ordering is by raw `u32` value.  Near the 2^32 wrap the lowest number is
//! not the oldest one; the receive path therefore pulls exact sequence
//! numbers with [`SequencedStore::remove`] instead of relying on order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::packet::Segment;

#[derive(Debug)]
struct Entry {
    segment: Segment,
    inserted_at: Instant,
}

/// Concurrency-safe ordered container keyed by sequence number.
#[derive(Debug, Default)]
pub struct SequencedStore {
    entries: Mutex<BTreeMap<u32, Entry>>,
    /// Wakes one blocked `consume_oldest` per insertion.
    available: Notify,
}

impl SequencedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `segment` under its sequence number, stamped with the current
    /// time.  An existing entry with the same number is replaced and its age
    /// restarts.
    pub fn insert(&self, segment: Segment) {
        let seq = segment.seq;
        let replaced = self
            .lock()
            .insert(
                seq,
                Entry {
                    segment,
                    inserted_at: Instant::now(),
                },
            )
            .is_some();
        if !replaced {
            self.available.notify_one();
        }
    }

    /// Wait until the store is non-empty, then remove and return the entry
    /// with the lowest sequence number.
    ///
    /// Cancel-safe: dropping the future never loses an entry.
    pub async fn consume_oldest(&self) -> Segment {
        loop {
            if let Some(segment) = self.try_consume_oldest() {
                return segment;
            }
            self.available.notified().await;
        }
    }

    /// Non-blocking variant of [`consume_oldest`](Self::consume_oldest).
    pub fn try_consume_oldest(&self) -> Option<Segment> {
        let mut entries = self.lock();
        let popped = entries.pop_first().map(|(_, entry)| entry.segment);
        // Another waiter may still find work.
        if popped.is_some() && !entries.is_empty() {
            self.available.notify_one();
        }
        popped
    }

    /// Remove and return every entry inserted more than `age` ago, in
    /// ascending sequence order.  Never blocks.
    pub fn consume_older_than(&self, age: Duration) -> Vec<Segment> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<u32> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.inserted_at) > age)
            .map(|(seq, _)| *seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| entries.remove(&seq))
            .map(|e| e.segment)
            .collect()
    }

    /// Remove the entry numbered `seq`, if present.
    pub fn remove(&self, seq: u32) -> Option<Segment> {
        self.lock().remove(&seq).map(|e| e.segment)
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.lock().contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
