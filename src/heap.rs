//! Generic min-heap used for both the tickable heap (C2, keyed by
//! `last_ticked`) and the outgoing heap (C3, keyed by `last_sent`).
//!
//! Built on `std::collections::BinaryHeap`, which is a max-heap, so entries
//! are wrapped to invert the ordering. Ties in the key are broken by a
//! monotonically increasing sequence number assigned at `push` time, which
//! keeps pop order deterministic for tests without changing the documented
//! semantics ("any consistent order among them is legal").

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::connection::ConnId;

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    key: u64,
    seq: u64,
    conn: ConnId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) pops the smallest key first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of `(key, ConnId)` pairs. No decrease-key: the driver always
/// pops, acts, and re-pushes.
#[derive(Debug, Default)]
pub struct ConnHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ConnHeap {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::with_capacity(4), next_seq: 0 }
    }

    pub fn push(&mut self, key: u64, conn: ConnId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { key, seq, conn });
    }

    pub fn pop(&mut self) -> Option<ConnId> {
        self.heap.pop().map(|e| e.conn)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
