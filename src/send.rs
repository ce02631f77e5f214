//! The host-supplied `packets_out` callback and the batch shape the egress
//! pipeline (C7) hands it.

use std::net::SocketAddr;

use crate::error::SendError;

/// One outgoing UDP datagram, ready for the host to hand to a socket.
#[derive(Debug)]
pub struct OutSpec<'a, Ctx> {
    pub buf: &'a [u8],
    pub ecn: u8,
    pub peer_ctx: Option<Ctx>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

/// Transmits a batch of outgoing packets.
///
/// Implementations return `Ok(n)` with `n` the number of datagrams actually
/// accepted (which may be less than `specs.len()` on a short write). `Err`
/// is treated the same as `Ok(0)` for backpressure purposes, matching the
/// original's "negative return means error, treat n_sent as 0" handling.
pub trait SendPackets<Ctx> {
    fn send(&mut self, specs: &[OutSpec<'_, Ctx>]) -> Result<usize, SendError>;
}

/// A [`SendPackets`] implementation that records every batch it receives
/// and always accepts everything. Used by the engine's own test suite and
/// handy for host integration tests.
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub batches: Vec<usize>,
    pub total_sent: usize,
}

impl<Ctx> SendPackets<Ctx> for RecordingSender {
    fn send(&mut self, specs: &[OutSpec<'_, Ctx>]) -> Result<usize, SendError> {
        self.batches.push(specs.len());
        self.total_sent += specs.len();
        Ok(specs.len())
    }
}
