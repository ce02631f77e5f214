//! The processing loop (C8) and connection factory (C9): the single type
//! hosts actually drive, tying every other collection together. Mirrors
//! `lsquic_engine_t` and its `process_conns`/`connect`/`packet_in` trio.

use std::net::SocketAddr;

use slab::Slab;

use crate::attq::Attq;
use crate::clock::{Clock, RealClock};
use crate::connection::{
    CceSet, ConnId, ConnState, Connection, ConnectionFactory, ConnStats,
};
use crate::egress::{self, EgressBudget, OutgoingIter};
use crate::error::{ConnectError, IngressError, IngressOutcome, NewEngineError};
use crate::handle::{EngineHandle, PendingInsert};
use crate::heap::ConnHeap;
use crate::ingress;
use crate::membership::MemberBit;
use crate::parser::{GenericCidParser, HeaderParserSelector};
use crate::pmi::PacketMemory;
use crate::registry::ConnectionRegistry;
use crate::send::SendPackets;
use crate::settings::{EngineSettings, RegistryMode};

/// Aggregate counters surfaced via [`Engine::stats`]. An ambient addition
/// (SPEC_FULL.md §9): the distilled spec only asks for per-connection
/// `ConnStats`, but a process-wide roll-up plus basic ingress/egress
/// health counters is what any host would actually want to log or export.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub conn: ConnStats,
    pub connections_in_memory: usize,
    pub connections_destroyed: u64,
    pub ingress_accepted: u64,
    pub ingress_dropped: u64,
    pub ingress_errors: u64,
}

/// The engine core: a single-threaded cooperative multiplexer over a
/// population of `C`-typed connections.
pub struct Engine<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    settings: EngineSettings,
    registry: ConnectionRegistry,
    arena: Slab<ConnState<C>>,
    tickable: ConnHeap,
    outgoing: ConnHeap,
    outgoing_iter: OutgoingIter,
    attq: Attq,
    factory: F,
    pmi: Box<dyn PacketMemory>,
    sender: Box<dyn SendPackets<C::PeerCtx>>,
    parser: Box<dyn HeaderParserSelector>,
    clock: Box<dyn Clock>,
    handle: EngineHandle,
    budget: EgressBudget,
    proc: bool,
    stats: EngineStats,
}

impl<C, F> Engine<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    /// Builds an engine with a real monotonic clock and the default
    /// generic-CID header parser.
    pub fn new(
        settings: EngineSettings,
        factory: F,
        pmi: Box<dyn PacketMemory>,
        sender: Box<dyn SendPackets<C::PeerCtx>>,
    ) -> Result<Self, NewEngineError> {
        Self::with_capabilities(
            settings,
            factory,
            pmi,
            sender,
            Box::new(GenericCidParser),
            Box::new(RealClock::default()),
        )
    }

    /// Builds an engine with caller-supplied parser and clock, used by
    /// hosts that already own an IETF-compliant parser and by tests that
    /// need a deterministic clock.
    pub fn with_capabilities(
        settings: EngineSettings,
        factory: F,
        pmi: Box<dyn PacketMemory>,
        sender: Box<dyn SendPackets<C::PeerCtx>>,
        parser: Box<dyn HeaderParserSelector>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, NewEngineError> {
        settings.validate()?;
        let mode = settings.registry_mode();
        Ok(Self {
            registry: ConnectionRegistry::new(mode),
            arena: Slab::new(),
            tickable: ConnHeap::new(),
            outgoing: ConnHeap::new(),
            outgoing_iter: OutgoingIter::new(),
            attq: Attq::new(),
            factory,
            pmi,
            sender,
            parser,
            clock,
            handle: EngineHandle::new(),
            budget: EgressBudget::default(),
            proc: false,
            stats: EngineStats::default(),
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Applies every [`PendingInsert`] queued by a connection callback that
    /// ran while `PROC` was set, then clears the queue. Called at the very
    /// start of `packet_in` and `process_conns`.
    fn drain_pending_inserts(&mut self) {
        for pending in self.handle.drain() {
            match pending {
                PendingInsert::Tickable(conn) => {
                    if let Some(state) = self.arena.get_mut(conn.0) {
                        if state.membership.has(MemberBit::Attq) {
                            self.attq.remove(conn);
                            state.membership.decref(MemberBit::Attq);
                        }
                        if !state.membership.has(MemberBit::Tickable) {
                            state.membership.incref(MemberBit::Tickable);
                            self.tickable.push(state.last_ticked, conn);
                        }
                    }
                }
                PendingInsert::Attq(conn, time) => {
                    if let Some(state) = self.arena.get_mut(conn.0) {
                        // A connection that is (or became) TICKABLE in the
                        // meantime will get its next wakeup the normal way,
                        // through C8 step 6's own `next_tick_time` call; per
                        // invariant 3 it must never also sit in the ATTQ.
                        if state.membership.has(MemberBit::Tickable) {
                            continue;
                        }
                        if !state.membership.has(MemberBit::Attq) {
                            state.membership.incref(MemberBit::Attq);
                        }
                        self.attq.add(conn, time);
                    }
                }
            }
        }
    }

    /// Client-only: opens a new connection to `peer`.
    #[tracing::instrument(skip(self))]
    pub fn connect(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        hostname: &str,
    ) -> Result<ConnId, ConnectError> {
        if self.settings.is_server {
            return Err(ConnectError::ServerMode);
        }
        if self.settings.registry_mode() == RegistryMode::ByEndpoint && self.registry.port_in_use(local) {
            return Err(ConnectError::PortInUse(local));
        }

        let conn = self
            .factory
            .new_client(local, peer, hostname, self.handle.clone())
            .ok_or(ConnectError::FactoryRefused)?;

        let mut state = ConnState::new(conn);
        state.local_addr = Some(local);
        state.peer_addr = Some(peer);
        let id = ConnId(self.arena.insert(state));

        match self.settings.registry_mode() {
            RegistryMode::ByEndpoint => {
                self.registry.insert_by_endpoint(local, peer, id);
            }
            RegistryMode::ByConnectionId => {}
        }

        let state = self.arena.get_mut(id.0).expect("just inserted");
        state.membership.incref(MemberBit::Hashed);
        state.membership.incref(MemberBit::Tickable);
        self.tickable.push(state.last_ticked, id);
        state.inner.client_call_on_new();

        Ok(id)
    }

    /// Registers a new connection ID for an already-live connection at CCE
    /// slot `idx`.
    pub fn add_cid(&mut self, conn: ConnId, idx: usize, cid: Vec<u8>) -> bool {
        let Some(state) = self.arena.get_mut(conn.0) else {
            return false;
        };
        if !self.registry.insert_by_cid(&cid, conn) {
            return false;
        }
        state.cces.set(idx, cid);
        true
    }

    /// Retires connection ID slot `idx`.
    pub fn retire_cid(&mut self, conn: ConnId, idx: usize, _now: u64) {
        let Some(state) = self.arena.get_mut(conn.0) else {
            return;
        };
        if state.cces.is_live(idx) {
            let cid = std::mem::take(&mut state.cces.cids[idx]);
            self.registry.remove_by_cid(&cid);
            state.cces.clear(idx);
        }
    }

    /// Registers a stateless-reset token for `conn` in C1, the counterpart
    /// to `add_cid` for the registry's reset-token table (§4.1). Returns
    /// `false` if `conn` is unknown or the token is already registered to
    /// another connection.
    pub fn add_reset_token(&mut self, conn: ConnId, token: [u8; 16]) -> bool {
        if self.arena.get(conn.0).is_none() {
            return false;
        }
        self.registry.insert_reset_token(token, conn)
    }

    /// Deregisters a stateless-reset token, e.g. once the connection that
    /// owned it has retired the CID it was bound to.
    pub fn remove_reset_token(&mut self, token: &[u8; 16]) -> Option<ConnId> {
        self.registry.remove_reset_token(token)
    }

    /// Routes an inbound UDP buffer (possibly several coalesced datagrams)
    /// to its owning connection(s).
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub fn packet_in(
        &mut self,
        data: &[u8],
        local: SocketAddr,
        peer: SocketAddr,
        ecn: u8,
    ) -> Result<IngressOutcome, IngressError> {
        debug_assert!(!self.proc, "packet_in called reentrantly");
        self.drain_pending_inserts();
        self.proc = true;
        let result = ingress::dispatch_packet_in(
            data,
            local,
            peer,
            ecn,
            self.clock.now_micros(),
            &self.settings,
            self.parser.as_mut(),
            &mut self.registry,
            &mut self.arena,
            &mut self.tickable,
            &mut self.attq,
            self.pmi.as_mut(),
        );
        self.proc = false;
        match &result {
            Ok(IngressOutcome::Delivered) => {
                self.stats.ingress_accepted += 1;
                crate::metrics::quic::ingress_accepted_count().inc();
            }
            Ok(IngressOutcome::Unowned) => {
                self.stats.ingress_dropped += 1;
                crate::metrics::quic::ingress_dropped_count(
                    crate::metrics::labels::IngressDropReason::NoOwner,
                )
                .inc();
            }
            Err(IngressError::OutOfMemory) => {
                self.stats.ingress_errors += 1;
                crate::metrics::quic::ingress_dropped_count(
                    crate::metrics::labels::IngressDropReason::OutOfMemory,
                )
                .inc();
            }
            Err(IngressError::ParseFailed) => {
                self.stats.ingress_errors += 1;
                crate::metrics::quic::ingress_dropped_count(
                    crate::metrics::labels::IngressDropReason::ParseFailed,
                )
                .inc();
            }
        }
        result
    }

    /// Runs one processing slice: drains the ATTQ, ticks every tickable
    /// connection, runs egress if sending is enabled, and reschedules.
    #[tracing::instrument(skip(self))]
    pub fn process_conns(&mut self) {
        debug_assert!(!self.proc, "process_conns called reentrantly");
        self.drain_pending_inserts();
        self.proc = true;

        let now = self.clock.now_micros();
        self.budget.maybe_resume(now);

        // Step 2: drain C4 into C2.
        while let Some(conn) = self.attq.pop(now) {
            if let Some(state) = self.arena.get_mut(conn.0) {
                state.membership.decref(MemberBit::Attq);
                if !state.membership.has(MemberBit::Tickable) {
                    state.membership.incref(MemberBit::Tickable);
                    self.tickable.push(state.last_ticked, conn);
                }
            }
        }

        // Step 3: drain C2, ticking each connection.
        let mut ticked_conns: Vec<ConnId> = Vec::new();
        let mut closed_conns: Vec<ConnId> = Vec::new();
        let mut i: u64 = 0;
        while let Some(conn) = self.tickable.pop() {
            let Some(state) = self.arena.get_mut(conn.0) else {
                continue;
            };
            state.membership.decref(MemberBit::Tickable);
            let outcome = state.inner.tick(now);
            state.last_ticked = now + i;
            i += 1;
            if let Some(conn_stats) = state.inner.get_stats() {
                self.stats.conn.add_assign(&conn_stats);
            }

            if outcome.close {
                state.membership.incref(MemberBit::Closing);
                if state.membership.has(MemberBit::Hashed) {
                    state.membership.decref(MemberBit::Hashed);
                    let cids: Vec<Vec<u8>> = state
                        .cces
                        .live_indices()
                        .map(|i| state.cces.cids[i].clone())
                        .collect();
                    self.registry.remove_all_cids(cids.into_iter());
                    if self.settings.registry_mode() == RegistryMode::ByEndpoint {
                        if let (Some(local), Some(peer)) = (state.local_addr, state.peer_addr) {
                            self.registry.remove_by_endpoint(local, peer);
                        }
                    }
                }
                closed_conns.push(conn);
            } else {
                if outcome.send && !state.membership.has(MemberBit::HasOutgoing) {
                    state.membership.incref(MemberBit::HasOutgoing);
                    self.outgoing.push(state.last_sent, conn);
                }
                state.membership.incref(MemberBit::Ticked);
                ticked_conns.push(conn);
            }
        }

        // Step 4: egress.
        if self.budget.can_send && !self.outgoing.is_empty() {
            let deadline = if self.settings.proc_time_thresh_micros == 0 {
                u64::MAX
            } else {
                now + self.settings.proc_time_thresh_micros
            };
            let destroyed = egress::drain(
                &mut self.outgoing,
                &mut self.outgoing_iter,
                &mut self.arena,
                &mut self.registry,
                self.pmi.as_mut(),
                self.sender.as_mut(),
                &mut ticked_conns,
                &mut closed_conns,
                self.clock.as_ref(),
                deadline,
                &mut self.budget,
            );
            self.stats.connections_destroyed += destroyed;
            crate::metrics::quic::connections_destroyed().inc_by(destroyed);
        }

        // Step 5: drain closed_conns. Egress may have appended BADCRYPT
        // closures above, so this runs after it returns.
        for conn in closed_conns {
            if let Some(state) = self.arena.get_mut(conn.0) {
                let destroy = state.membership.decref(MemberBit::Closing);
                if destroy {
                    self.arena.remove(conn.0);
                    self.stats.connections_destroyed += 1;
                    crate::metrics::quic::connections_destroyed().inc();
                }
            }
        }

        // Step 6: drain ticked_conns, rescheduling each.
        for conn in ticked_conns {
            let Some(state) = self.arena.get_mut(conn.0) else {
                continue;
            };
            state.membership.decref(MemberBit::Ticked);
            if state.never_tickable {
                continue;
            }
            if state.inner.is_tickable() {
                if !state.membership.has(MemberBit::Tickable) {
                    state.membership.incref(MemberBit::Tickable);
                    self.tickable.push(state.last_ticked, conn);
                }
            } else {
                match state.inner.next_tick_time() {
                    Some(t) => {
                        if !state.membership.has(MemberBit::Attq) {
                            state.membership.incref(MemberBit::Attq);
                        }
                        self.attq.add(conn, t);
                    }
                    None => {
                        debug_assert!(
                            false,
                            "connection is neither tickable nor has a next tick time"
                        );
                        tracing::warn!(
                            "connection {:?} is neither tickable nor scheduled; marking never-tickable",
                            conn
                        );
                        state.never_tickable = true;
                    }
                }
            }
        }

        self.stats.connections_in_memory = self.arena.len();
        crate::metrics::quic::connections_in_memory().set(self.arena.len() as i64);
        self.proc = false;
    }

    /// Forces one egress drain outside the normal `process_conns` cadence
    /// (e.g. a host resuming after it observed its socket become writable
    /// again).
    pub fn send_unsent_packets(&mut self) {
        debug_assert!(!self.proc, "send_unsent_packets called reentrantly");
        self.proc = true;
        let now = self.clock.now_micros();
        self.budget.can_send = true;
        let deadline = if self.settings.proc_time_thresh_micros == 0 {
            u64::MAX
        } else {
            now + self.settings.proc_time_thresh_micros
        };
        let mut ticked = Vec::new();
        let mut closed = Vec::new();
        let destroyed = egress::drain(
            &mut self.outgoing,
            &mut self.outgoing_iter,
            &mut self.arena,
            &mut self.registry,
            self.pmi.as_mut(),
            self.sender.as_mut(),
            &mut ticked,
            &mut closed,
            self.clock.as_ref(),
            deadline,
            &mut self.budget,
        );
        self.stats.connections_destroyed += destroyed;
        crate::metrics::quic::connections_destroyed().inc_by(destroyed);
        for conn in closed {
            if let Some(state) = self.arena.get_mut(conn.0) {
                if state.membership.decref(MemberBit::Closing) {
                    self.arena.remove(conn.0);
                    self.stats.connections_destroyed += 1;
                    crate::metrics::quic::connections_destroyed().inc();
                }
            }
        }
        self.proc = false;
    }

    pub fn has_unsent_packets(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Microseconds from now until the engine next has work, or `None` if
    /// there is nothing scheduled.
    pub fn earliest_adv_tick(&self) -> Option<i64> {
        if (!self.outgoing.is_empty() && self.budget.past_deadline) || !self.tickable.is_empty() {
            return Some(0);
        }
        let now = self.clock.now_micros() as i64;
        let attq_next = self.attq.next_time().map(|t| t as i64 - now);
        let resume_next = if !self.budget.can_send {
            Some(self.budget.resume_sending_at as i64 - now)
        } else {
            None
        };
        match (attq_next, resume_next) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (Some(a), None) => Some(a),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        }
    }

    /// Number of ATTQ entries scheduled to fire within `from_now`
    /// microseconds.
    pub fn count_attq(&self, from_now: i64) -> usize {
        let now = self.clock.now_micros() as i64;
        let cutoff = (now + from_now).max(0) as u64;
        self.attq.count_before(cutoff)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.arena.len()
    }
}

impl<C, F> Drop for Engine<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    /// Forces every connection closed: drains C3 and C2 (decreffing), then
    /// sweeps whatever remains in C1, cascading through each connection's
    /// own membership decrefs until the arena empties via ordinary `Drop`.
    fn drop(&mut self) {
        while let Some(conn) = self.outgoing.pop() {
            if let Some(state) = self.arena.get_mut(conn.0) {
                if state.membership.has(MemberBit::HasOutgoing) {
                    state.membership.decref(MemberBit::HasOutgoing);
                }
            }
        }
        while let Some(conn) = self.tickable.pop() {
            if let Some(state) = self.arena.get_mut(conn.0) {
                if state.membership.has(MemberBit::Tickable) {
                    state.membership.decref(MemberBit::Tickable);
                }
            }
        }
        let ids: Vec<usize> = self.arena.iter().map(|(k, _)| k).collect();
        for key in ids {
            if let Some(state) = self.arena.get_mut(key) {
                if state.membership.has(MemberBit::Attq) {
                    self.attq.remove(ConnId(key));
                    state.membership.decref(MemberBit::Attq);
                }
                if state.membership.has(MemberBit::Hashed) {
                    state.membership.decref(MemberBit::Hashed);
                }
            }
        }
    }
}

/// Helper used by connection factories building a fresh slot's CCE set
/// outside of `Engine::connect` (e.g. a factory that pre-registers
/// additional CIDs at creation time). Exposed for symmetry with `add_cid`;
/// most factories won't need it directly.
pub fn new_cce_set() -> CceSet {
    CceSet::default()
}
