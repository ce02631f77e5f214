//! The narrow capability interface the engine core drives every connection
//! through, plus the engine-owned record (`ConnState`) that wraps it.
//!
//! Everything protocol-specific — the handshake, loss recovery, stream
//! multiplexing, the crypto session — lives behind [`Connection`]. The
//! engine never inspects an implementor's internals; it only calls the
//! methods below and reacts to their return values.

use std::net::SocketAddr;

use crate::handle::EngineHandle;
use crate::membership::Membership;
use crate::pmi::{PacketBuf, PacketMemory};

/// Stable handle to a connection's slot in the engine's arena
/// (`slab::Slab<ConnState<C>>`). Every collection (registry, both heaps,
/// the ATTQ) stores this instead of a reference, so none of them need to
/// borrow from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

/// What a single `tick()` call asked the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// The connection has at least one packet ready; put it on the outgoing
    /// heap (C3) if it isn't already there.
    pub send: bool,
    /// The connection wants to close; move it to the transient closed list
    /// and drop it out of the registry.
    pub close: bool,
}

impl TickOutcome {
    pub const NONE: Self = Self { send: false, close: false };
    pub const SEND: Self = Self { send: true, close: false };
    pub const CLOSE: Self = Self { send: false, close: true };
    pub const SEND_AND_CLOSE: Self = Self { send: true, close: true };
}

/// Outcome of asking a connection to encrypt a packet it is about to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptOutcome {
    /// Encryption succeeded; the packet is ready to batch.
    Ok,
    /// Transient failure (e.g. no packet-memory buffer available right
    /// now). The egress drain flushes what it has and stops for this
    /// connection; the packet is returned via `packet_not_sent`.
    Nomem,
    /// The connection's crypto state cannot produce any more packets. The
    /// connection is unsendable and must be closed.
    BadCrypto,
}

/// Coarse, summable statistics a connection may optionally report. Rolled
/// into [`crate::engine::EngineStats`] on destruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub ticks: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnStats {
    pub fn add_assign(&mut self, other: &ConnStats) {
        self.ticks += other.ticks;
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

/// A packet a connection wants the egress pipeline to send.
#[derive(Debug)]
pub struct PacketOut {
    /// Plaintext payload, used when `enc_data` is `None` and
    /// `no_encrypt_needed` is set (e.g. version-negotiation / stateless
    /// reset packets, which are never encrypted).
    pub plaintext: Vec<u8>,
    /// Set once `Connection::encrypt_packet` has produced ciphertext in a
    /// PMI-owned buffer.
    pub enc_data: Option<PacketBuf>,
    /// This packet never needs encryption (skip the `encrypt_packet` call
    /// entirely).
    pub no_encrypt_needed: bool,
    /// ECN codepoint to stamp on the UDP datagram.
    pub ecn: u8,
    /// Whether this packet was built against an IPv6 peer address. Used to
    /// detect a peer-address change between encryption and send (§4.6 step 2).
    pub ipv6: bool,
    /// Filled in by the egress pipeline immediately before the batch is
    /// flushed to the host (the "pre-stamp" rule in SPEC_FULL.md §4.6).
    pub sent_at: Option<u64>,
}

impl PacketOut {
    pub fn is_encrypted(&self) -> bool {
        self.enc_data.is_some()
    }

    /// The bytes that should actually go out on the wire.
    pub fn wire_bytes(&self) -> &[u8] {
        match &self.enc_data {
            Some(buf) => buf.as_ref(),
            None => &self.plaintext,
        }
    }
}

/// A single inbound datagram (or coalesced packet within one), handed to
/// the owning connection by the ingress dispatcher.
#[derive(Debug)]
pub struct InboundPacket<'a> {
    pub data: &'a [u8],
    pub received_at: u64,
    pub ecn: u8,
}

/// The capability interface a connection's state machine must implement.
/// `PeerCtx` is the opaque per-connection context the host attaches to
/// outgoing send specs (the `void *peer_ctx` of the original).
pub trait Connection {
    type PeerCtx: Clone;

    /// Advance time to `now`. Returns what the engine should do next.
    fn tick(&mut self, now: u64) -> TickOutcome;

    /// Hand an inbound packet to the connection. The connection must copy
    /// out any data it wants to retain; `pkt.data` does not outlive the call.
    fn packet_in(&mut self, pkt: InboundPacket<'_>);

    /// Pull the next packet ready to go out, if any.
    fn next_packet_to_send(&mut self) -> Option<PacketOut>;

    /// Called once a packet has been handed to the host's send callback and
    /// accepted.
    fn packet_sent(&mut self, pkt: &PacketOut);

    /// Called when a packet could not be sent this round (deadline,
    /// backpressure, or a short write). The connection should requeue it.
    fn packet_not_sent(&mut self, pkt: PacketOut);

    /// Encrypt `pkt` in place, using `pmi` to obtain the ciphertext buffer.
    fn encrypt_packet(&mut self, pkt: &mut PacketOut, pmi: &mut dyn PacketMemory) -> EncryptOutcome;

    /// Is this connection eligible to run right now?
    fn is_tickable(&self) -> bool;

    /// When should this connection next be ticked, if it isn't tickable
    /// now? `None` here for a non-tickable connection is a programming
    /// error in the connection implementation (see §7).
    fn next_tick_time(&self) -> Option<u64>;

    /// An IETF stateless-reset token matching this connection's CIDs arrived.
    fn stateless_reset(&mut self) {}

    /// Client-only: called once, right after the connection is registered.
    fn client_call_on_new(&mut self) {}

    /// Optional per-connection statistics, summed into the engine's totals
    /// on destruction.
    fn get_stats(&self) -> Option<ConnStats> {
        None
    }

    /// A short-lived connection (e.g. a retry or version-negotiation stub)
    /// that must not be reactivated by the egress iterator after a failed
    /// send — see SPEC_FULL.md glossary, "Evanescent".
    fn is_evanescent(&self) -> bool {
        false
    }

    /// Is the peer address this connection last recorded an IPv6 address?
    fn peer_is_ipv6(&self) -> bool;
}

/// Creates connections on behalf of the engine (C9).
pub trait ConnectionFactory {
    type Conn: Connection;

    /// Build a client-initiated connection. Returning `None` aborts the
    /// `connect` call with [`crate::error::ConnectError::FactoryRefused`].
    /// `handle` is the facade the connection should hold onto to reschedule
    /// itself from inside its own callbacks (see [`crate::handle::EngineHandle`]).
    fn new_client(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        hostname: &str,
        handle: EngineHandle,
    ) -> Option<Self::Conn>;

    /// Build a server-side connection in response to an inbound Initial
    /// packet. Used by the ingress dispatcher when running in server mode
    /// and no existing connection owns the datagram; `None` means "drop it".
    fn new_server(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        handle: EngineHandle,
    ) -> Option<Self::Conn> {
        let _ = (local, peer, handle);
        None
    }
}

/// One connection-ID element: the raw key bytes registered in C1, and
/// whether this slot is currently live. The engine tracks up to
/// [`MAX_CCES`] of these per connection, mirroring `cn_cces`/`cn_cces_mask`.
pub const MAX_CCES: usize = 8;

#[derive(Debug, Default, Clone)]
pub struct CceSet {
    pub(crate) mask: u8,
    pub(crate) cids: [Vec<u8>; MAX_CCES],
}

impl CceSet {
    pub fn set(&mut self, idx: usize, cid: Vec<u8>) {
        assert!(idx < MAX_CCES);
        self.cids[idx] = cid;
        self.mask |= 1 << idx;
    }

    pub fn clear(&mut self, idx: usize) {
        assert!(idx < MAX_CCES);
        self.mask &= !(1 << idx);
    }

    pub fn is_live(&self, idx: usize) -> bool {
        self.mask & (1 << idx) != 0
    }

    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CCES).filter(move |i| self.is_live(*i))
    }
}

/// The engine-owned record wrapping a connection: membership bits, heap
/// keys, recorded addresses, and the connection implementation itself.
/// Stored by value in the arena (`slab::Slab<ConnState<C>>`); every other
/// collection refers to it by [`ConnId`].
pub struct ConnState<C: Connection> {
    pub membership: Membership,
    pub last_ticked: u64,
    pub last_sent: u64,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub peer_ctx: Option<C::PeerCtx>,
    pub version: u32,
    /// Poisoned once destroyed so that a stray re-insertion attempt (e.g. a
    /// late callback racing the destructor) is rejected rather than
    /// resurrecting a dead slot. Set once, by the engine, on destruction.
    pub never_tickable: bool,
    pub cces: CceSet,
    pub inner: C,
}

impl<C: Connection> ConnState<C> {
    pub fn new(inner: C) -> Self {
        Self {
            membership: Membership::new(),
            last_ticked: 0,
            last_sent: 0,
            local_addr: None,
            peer_addr: None,
            peer_ctx: None,
            version: 0,
            never_tickable: false,
            cces: CceSet::default(),
            inner,
        }
    }
}
