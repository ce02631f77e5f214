//! The facade connections use to call back into the engine while it is
//! mid-callback. Honors the `PROC` reentrancy rule (SPEC_FULL.md §5): calls
//! made while the engine is inside a processing call are queued rather than
//! applied immediately, and drained at the start of the next outer call.

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::ConnId;

/// A deferred scheduling request raised by a connection callback.
#[derive(Debug, Clone, Copy)]
pub enum PendingInsert {
    /// Re-add to the tickable heap (C2).
    Tickable(ConnId),
    /// Schedule a future wakeup through the ATTQ (C4).
    Attq(ConnId, u64),
}

/// Cheap, cloneable handle to the engine's pending-insert queue. Given to
/// connections at construction time so they can ask to be rescheduled from
/// inside a callback without borrowing the engine itself.
#[derive(Debug, Clone, Default)]
pub struct EngineHandle {
    pending: Rc<RefCell<Vec<PendingInsert>>>,
}

impl EngineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask to be made tickable again. Always deferred: applied by the
    /// engine at the start of its next `process_conns`/`packet_in` call.
    pub fn add_to_tickable(&self, conn: ConnId) {
        self.pending.borrow_mut().push(PendingInsert::Tickable(conn));
    }

    /// Ask for a future wakeup at `time`.
    pub fn add_to_attq(&self, conn: ConnId, time: u64) {
        self.pending.borrow_mut().push(PendingInsert::Attq(conn, time));
    }

    /// Drains every queued request. Called by the engine only, at the top
    /// of a processing call.
    pub fn drain(&self) -> Vec<PendingInsert> {
        self.pending.borrow_mut().drain(..).collect()
    }
}
