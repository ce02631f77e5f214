//! Egress Pipeline (C7): walks the outgoing heap, encrypts and batches
//! packets, and applies AIMD-style batch sizing, mirroring
//! `lsquic_engine_send_unsent_packets` / `send_batch`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use slab::Slab;
use smallvec::SmallVec;

use crate::clock::Clock;
use crate::connection::{Connection, ConnId, ConnState, EncryptOutcome, PacketOut};
use crate::heap::ConnHeap;
use crate::membership::MemberBit;
use crate::pmi::PacketMemory;
use crate::registry::ConnectionRegistry;
use crate::send::{OutSpec, SendPackets};
use crate::settings::RegistryMode;

pub const MIN_BATCH: usize = 4;
pub const MAX_BATCH: usize = 1024;
pub const INITIAL_BATCH: usize = 32;

/// Inline capacity of the out-batch scratch buffer. Matches
/// [`INITIAL_BATCH`], the common case, so a batch that never grows past the
/// default size never touches the heap; larger batch sizes (up to
/// [`MAX_BATCH`]) spill over transparently.
const SCRATCH_INLINE: usize = INITIAL_BATCH;
/// Failsafe backoff applied after a short write, in microseconds.
const SEND_BACKOFF_MICROS: u64 = 1_000_000;

/// The feedback-controlled knobs that persist across `process_conns` calls:
/// current batch size, the monotonic `last_sent` counter, and the
/// send-backpressure state machine.
#[derive(Debug, Clone)]
pub struct EgressBudget {
    pub batch_size: usize,
    pub last_sent: u64,
    pub can_send: bool,
    pub resume_sending_at: u64,
    pub past_deadline: bool,
}

impl Default for EgressBudget {
    fn default() -> Self {
        Self {
            batch_size: INITIAL_BATCH,
            last_sent: 0,
            can_send: true,
            resume_sending_at: 0,
            past_deadline: false,
        }
    }
}

impl EgressBudget {
    /// Re-enables sending if the failsafe window has elapsed.
    pub fn maybe_resume(&mut self, now: u64) {
        if !self.can_send && now > self.resume_sending_at {
            self.can_send = true;
        }
    }
}

/// Iterator state over C3: an active (currently yielding packets) and an
/// inactive (exhausted this drain) FIFO list, plus whatever is still on the
/// heap waiting to be popped in.
#[derive(Debug, Default)]
pub struct OutgoingIter {
    active: VecDeque<ConnId>,
    inactive: VecDeque<ConnId>,
}

impl OutgoingIter {
    pub fn new() -> Self {
        Self::default()
    }

    fn reactivate(&mut self, conn: ConnId) {
        if !self.active.contains(&conn) {
            self.active.push_back(conn);
        }
    }

    fn deactivate(&mut self, conn: ConnId) {
        self.inactive.push_back(conn);
    }
}

/// One pending send, carrying its owning connection and the wire bytes
/// needed to build an [`OutSpec`] once the batch is ready to flush.
struct Slot<C: Connection> {
    conn: ConnId,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    peer_ctx: Option<C::PeerCtx>,
    pkt: PacketOut,
}

/// Runs one full egress drain: pulls connections off `heap`, round-robins
/// them through an [`OutgoingIter`], and flushes batches through `sender`
/// until either the heap and active list are both empty or `clock` crosses
/// `deadline`.
#[allow(clippy::too_many_arguments)]
pub fn drain<C, S>(
    heap: &mut ConnHeap,
    iter: &mut OutgoingIter,
    arena: &mut Slab<ConnState<C>>,
    registry: &mut ConnectionRegistry,
    pmi: &mut dyn PacketMemory,
    sender: &mut S,
    ticked: &mut Vec<ConnId>,
    closed: &mut Vec<ConnId>,
    clock: &dyn Clock,
    deadline: u64,
    budget: &mut EgressBudget,
) -> u64
where
    C: Connection,
    S: SendPackets<C::PeerCtx> + ?Sized,
{
    let mut destroyed = 0u64;
    budget.past_deadline = false;
    let mut slots: SmallVec<[Slot<C>; SCRATCH_INLINE]> = SmallVec::with_capacity(budget.batch_size);

    loop {
        if !budget.can_send {
            break;
        }

        // Pull one more connection off the heap into the active round if
        // the active list has run dry but the heap still has entries.
        if iter.active.is_empty() {
            match heap.pop() {
                Some(conn) => iter.active.push_back(conn),
                None => {
                    if iter.active.is_empty() {
                        break;
                    }
                }
            }
        }

        let Some(conn) = iter.active.pop_front() else {
            break;
        };

        let Some(state) = arena.get_mut(conn.0) else {
            continue;
        };

        match state.inner.next_packet_to_send() {
            None => {
                iter.deactivate(conn);
            }
            Some(mut pkt) => {
                // Step 2: IPv6-mismatch re-encrypt.
                if pkt.is_encrypted() && pkt.ipv6 != state.inner.peer_is_ipv6() {
                    if let Some(buf) = pkt.enc_data.take() {
                        pmi.return_buf(buf, pkt.ipv6);
                    }
                }

                // Step 3: encrypt if needed.
                if !pkt.is_encrypted() && !pkt.no_encrypt_needed {
                    match state.inner.encrypt_packet(&mut pkt, pmi) {
                        EncryptOutcome::Nomem => {
                            // Transient packet-memory exhaustion, not a
                            // reason to stop scheduling this connection:
                            // leave it active so it's re-heaped below and
                            // retried next slice, and stop collecting more
                            // work against memory that's already exhausted.
                            state.inner.packet_not_sent(pkt);
                            iter.active.push_back(conn);
                            flush(&mut slots, sender, pmi, arena, iter, clock, budget);
                            break;
                        }
                        EncryptOutcome::BadCrypto => {
                            state.inner.packet_not_sent(pkt);
                            state.membership.incref(MemberBit::Closing);
                            if state.membership.has(MemberBit::Hashed) {
                                state.membership.decref(MemberBit::Hashed);
                                let cids: Vec<Vec<u8>> = state
                                    .cces
                                    .live_indices()
                                    .map(|i| state.cces.cids[i].clone())
                                    .collect();
                                registry.remove_all_cids(cids.into_iter());
                                if registry.mode() == RegistryMode::ByEndpoint {
                                    if let (Some(local), Some(peer)) =
                                        (state.local_addr, state.peer_addr)
                                    {
                                        registry.remove_by_endpoint(local, peer);
                                    }
                                }
                            }
                            // This connection is being forcibly evicted from
                            // C3's bookkeeping (it's leaving both the heap
                            // and the iterator for good), so its HasOutgoing
                            // reference is released here rather than waiting
                            // for a normal drain of the inactive list.
                            if state.membership.has(MemberBit::HasOutgoing) {
                                state.membership.decref(MemberBit::HasOutgoing);
                            }
                            let was_ticked = {
                                let before = ticked.len();
                                ticked.retain(|&id| id != conn);
                                before != ticked.len()
                            };
                            if was_ticked && state.membership.has(MemberBit::Ticked) {
                                state.membership.decref(MemberBit::Ticked);
                            }
                            iter.inactive.retain(|&id| id != conn);
                            iter.active.retain(|&id| id != conn);
                            // Hand off to C8's closed-connection drain so the
                            // Closing reference set above is eventually
                            // released and the connection destroyed once its
                            // membership mask reaches zero (SPEC_FULL.md §4.6).
                            closed.push(conn);
                            continue;
                        }
                        EncryptOutcome::Ok => {}
                    }
                }

                slots.push(Slot {
                    conn,
                    local_addr: state.local_addr,
                    peer_addr: state.peer_addr,
                    peer_ctx: state.peer_ctx.clone(),
                    pkt,
                });
                iter.active.push_back(conn);

                if slots.len() >= budget.batch_size {
                    flush(&mut slots, sender, pmi, arena, iter, clock, budget);
                    if budget.past_deadline || !budget.can_send {
                        break;
                    }
                }
            }
        }

        if clock.now_micros() >= deadline {
            budget.past_deadline = true;
            break;
        }
    }

    if !slots.is_empty() {
        flush(&mut slots, sender, pmi, arena, iter, clock, budget);
    }

    // Re-heap everything still active (it has more to send next call);
    // anything left only on the inactive list is done for now.
    while let Some(conn) = iter.active.pop_front() {
        if let Some(state) = arena.get(conn.0) {
            heap.push(state.last_sent, conn);
        }
    }
    while let Some(conn) = iter.inactive.pop_front() {
        if let Some(state) = arena.get_mut(conn.0) {
            if state.membership.has(MemberBit::HasOutgoing) {
                // A connection already marked Closing in a prior slice (e.g.
                // egress was skipped entirely while `!CAN_SEND`) may have
                // HasOutgoing as its last remaining reference; this decref
                // can be the one that brings its mask to zero.
                if state.membership.decref(MemberBit::HasOutgoing) {
                    arena.remove(conn.0);
                    destroyed += 1;
                }
            }
        }
    }

    destroyed
}

fn flush<C, S>(
    slots: &mut SmallVec<[Slot<C>; SCRATCH_INLINE]>,
    sender: &mut S,
    pmi: &mut dyn PacketMemory,
    arena: &mut Slab<ConnState<C>>,
    iter: &mut OutgoingIter,
    clock: &dyn Clock,
    budget: &mut EgressBudget,
) where
    C: Connection,
    S: SendPackets<C::PeerCtx> + ?Sized,
{
    if slots.is_empty() {
        return;
    }
    let now = clock.now_micros();
    for slot in slots.iter_mut() {
        slot.pkt.sent_at = Some(now);
    }

    let specs: Vec<OutSpec<'_, C::PeerCtx>> = slots
        .iter()
        .map(|slot| OutSpec {
            buf: slot.pkt.wire_bytes(),
            ecn: slot.pkt.ecn,
            peer_ctx: slot.peer_ctx.clone(),
            local_addr: slot.local_addr,
            peer_addr: slot.peer_addr,
        })
        .collect();

    let n_sent = match sender.send(&specs) {
        Ok(n) => n,
        Err(err) => {
            tracing::debug!(error = %err, "egress: send failed, entering backpressure");
            crate::metrics::quic::write_errors(crate::metrics::labels::SendFailureReason::Transport)
                .inc();
            0
        }
    };
    drop(specs);

    let attempted = slots.len();
    crate::metrics::quic::batch_size().observe(attempted as f64);
    if n_sent < attempted {
        if n_sent > 0 {
            crate::metrics::quic::write_errors(crate::metrics::labels::SendFailureReason::Partial)
                .inc();
        }
        let was_sending = budget.can_send;
        budget.can_send = false;
        budget.resume_sending_at = now + SEND_BACKOFF_MICROS;
        if was_sending {
            crate::metrics::quic::backpressure_activations().inc();
        }
    }

    let mut drained = std::mem::take(slots);
    for (i, slot) in drained.drain(..attempted.min(n_sent)).enumerate() {
        let stamp = now + i as u64;
        budget.last_sent = stamp;
        if let Some(state) = arena.get_mut(slot.conn.0) {
            state.inner.packet_sent(&slot.pkt);
            state.last_sent = stamp;
            if let Some(buf) = slot.pkt.enc_data {
                pmi.release(buf, slot.pkt.ipv6);
            }
        }
    }

    for slot in drained.into_iter().rev() {
        if let Some(state) = arena.get_mut(slot.conn.0) {
            let evanescent = state.inner.is_evanescent();
            state.inner.packet_not_sent(slot.pkt);
            if !evanescent {
                iter.reactivate(slot.conn);
            }
        }
    }

    if !budget.past_deadline {
        if n_sent >= attempted && attempted > 0 {
            budget.batch_size = (budget.batch_size * 2).min(MAX_BATCH);
        } else if n_sent < attempted {
            budget.batch_size = (budget.batch_size / 2).max(MIN_BATCH);
        }
    }
}
