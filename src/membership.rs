//! The six-bit membership mask plus the two transient egress-iterator bits.
//!
//! Mirrors `enum lsquic_conn_flags` / `CONN_REF_FLAGS` from the original
//! engine: a connection's reference count is never tracked as a separate
//! integer, it *is* the popcount of this mask.

/// One bit per collection a connection can be simultaneously registered in,
/// plus the two transient bits owned by the egress iterator (`egress::OutgoingIter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberBit {
    /// In the registry (C1).
    Hashed = 1 << 0,
    /// In the outgoing heap (C3).
    HasOutgoing = 1 << 1,
    /// In the tickable heap (C2).
    Tickable = 1 << 2,
    /// In C8's transient `ticked_conns` list.
    Ticked = 1 << 3,
    /// In C8's transient `closed_conns` list.
    Closing = 1 << 4,
    /// In the advisory tick-time queue (C4).
    Attq = 1 << 5,
    /// On the egress iterator's active list.
    CoiActive = 1 << 6,
    /// On the egress iterator's inactive list.
    CoiInactive = 1 << 7,
}

/// The six bits that count as "real" references for destruction purposes.
/// `CoiActive`/`CoiInactive` are iterator bookkeeping, not references: a
/// connection must be in exactly one of {active, inactive, neither} while
/// `HasOutgoing` is set, but those two bits never keep it alive on their own.
const REF_MASK: u8 = MemberBit::Hashed as u8
    | MemberBit::HasOutgoing as u8
    | MemberBit::Tickable as u8
    | MemberBit::Ticked as u8
    | MemberBit::Closing as u8
    | MemberBit::Attq as u8;

/// The membership mask for a single connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Membership(u8);

impl Membership {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn has(&self, bit: MemberBit) -> bool {
        self.0 & bit as u8 != 0
    }

    /// Sets `bit`. Debug-asserts the bit was previously clear, mirroring
    /// `engine_incref_conn`'s `assert(!(conn->cn_flags & flag))`.
    pub fn incref(&mut self, bit: MemberBit) {
        debug_assert!(!self.has(bit), "incref of an already-set bit {bit:?}");
        self.0 |= bit as u8;
    }

    /// Clears `bit`. Debug-asserts the bit was previously set, mirroring
    /// `engine_decref_conn`'s `assert(conn->cn_flags & flags)`. Returns
    /// `true` if this was the transition of the six reference bits to zero
    /// (i.e. the connection should now be destroyed).
    pub fn decref(&mut self, bit: MemberBit) -> bool {
        debug_assert!(self.has(bit), "decref of an unset bit {bit:?}");
        self.0 &= !(bit as u8);
        self.0 & REF_MASK == 0
    }

    /// Total popcount across all eight tracked bits (six references plus
    /// the two transient iterator bits), matching invariant 1 in
    /// SPEC_FULL.md §3 ("... plus the popcount of its COI bits").
    pub fn refcount(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_referenced(&self) -> bool {
        self.0 & REF_MASK != 0
    }
}
