//! Ingress Dispatcher (C6): routes a (possibly coalesced) inbound UDP
//! buffer to the connection(s) that own it, mirroring
//! `lsquic_engine_packet_in`.

use std::net::SocketAddr;

use slab::Slab;

use crate::attq::Attq;
use crate::connection::{Connection, ConnId, ConnState, InboundPacket};
use crate::error::{IngressError, IngressOutcome};
use crate::membership::MemberBit;
use crate::parser::HeaderParserSelector;
use crate::pmi::PacketMemory;
use crate::registry::ConnectionRegistry;
use crate::settings::{EngineSettings, RegistryMode};
use crate::heap::ConnHeap;

/// Minimum length, in bytes, an IETF-shaped short-header datagram must have
/// to plausibly carry a trailing 16-byte stateless-reset token.
const MIN_STATELESS_RESET_SIZE: usize = 21;

/// Routes every datagram in `data` to its owning connection.
///
/// `data` may contain more than one coalesced QUIC datagram back to back;
/// the loop advances by each [`crate::parser::ParsedHeader::consumed`]
/// until the buffer is exhausted. A parse failure on the *first* datagram
/// is returned as `Err`; failures on later datagrams in the same buffer are
/// traced and skipped, matching the "keep going" ingress contract.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_packet_in<C: Connection>(
    data: &[u8],
    local: SocketAddr,
    peer: SocketAddr,
    ecn: u8,
    now: u64,
    settings: &EngineSettings,
    parser: &mut dyn HeaderParserSelector,
    registry: &mut ConnectionRegistry,
    arena: &mut Slab<ConnState<C>>,
    tickable: &mut ConnHeap,
    attq: &mut Attq,
    pmi: &mut dyn PacketMemory,
) -> Result<IngressOutcome, IngressError> {
    let mut offset = 0usize;
    let mut delivered = false;
    let mut first = true;

    while offset < data.len() {
        let slice = &data[offset..];

        // Step 2: allocate a descriptor-sized scratch buffer from the PMI
        // and run the parser over the borrowed slice.
        if pmi.allocate(slice.len().max(1), peer.is_ipv6()).is_none() {
            if first {
                return Err(IngressError::OutOfMemory);
            }
            tracing::debug!("ingress: out of memory parsing trailing datagram, dropping rest");
            break;
        }

        let parsed = match parser.parse_begin(slice) {
            Some(p) => p,
            None => {
                if first {
                    return Err(IngressError::ParseFailed);
                }
                tracing::debug!("ingress: failed to parse trailing datagram, dropping rest");
                break;
            }
        };
        let consumed = parsed.consumed.max(1);

        // Step 3: look up the owner.
        let owner = match settings.registry_mode() {
            RegistryMode::ByEndpoint => registry.lookup_by_endpoint(local, peer),
            RegistryMode::ByConnectionId => registry.lookup_by_cid(&parsed.dcid),
        };

        let mut via_reset_token = false;
        let owner = match owner {
            Some(id) => Some(id),
            None => {
                // Step 4: stateless-reset fallback.
                if settings.honor_prst
                    && parsed.is_short_header
                    && slice.len() >= MIN_STATELESS_RESET_SIZE
                {
                    let token_start = slice.len() - 16;
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&slice[token_start..]);
                    let found = registry.lookup_by_reset_token(&token);
                    via_reset_token = found.is_some();
                    found
                } else {
                    None
                }
            }
        };

        match owner {
            None => {
                tracing::debug!("ingress: datagram has no owning connection, dropping");
            }
            Some(id) => {
                if let Some(state) = arena.get_mut(id.0) {
                    if via_reset_token {
                        state.inner.stateless_reset();
                        mark_tickable(state, id, tickable, attq);
                    } else {
                        state.local_addr = Some(local);
                        state.peer_addr = Some(peer);
                        mark_tickable(state, id, tickable, attq);
                        state.inner.packet_in(InboundPacket {
                            data: &slice[..consumed.min(slice.len())],
                            received_at: now,
                            ecn,
                        });
                    }
                    delivered = true;
                }
            }
        }

        offset += consumed;
        first = false;
    }

    if delivered {
        Ok(IngressOutcome::Delivered)
    } else {
        Ok(IngressOutcome::Unowned)
    }
}

/// Marks `state` tickable, inserting it into C2 if it wasn't already there.
/// If the connection was parked in the ATTQ (C4) awaiting a future wakeup,
/// that entry is pulled out first -- invariant 3 (SPEC_FULL.md §3) requires
/// TICKABLE and ATTQ stay mutually exclusive, and a connection that just
/// received a packet has work to do *now*, making its old scheduled wakeup
/// moot.
fn mark_tickable<C: Connection>(
    state: &mut ConnState<C>,
    id: ConnId,
    tickable: &mut ConnHeap,
    attq: &mut Attq,
) {
    if state.membership.has(MemberBit::Attq) {
        attq.remove(id);
        state.membership.decref(MemberBit::Attq);
    }
    if !state.membership.has(MemberBit::Tickable) {
        state.membership.incref(MemberBit::Tickable);
        tickable.push(state.last_ticked, id);
    }
}
