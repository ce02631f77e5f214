//! Packet-Memory Interface (PMI): the host-provided allocator for
//! encryption buffers. The core never allocates or frees these itself
//! (SPEC_FULL.md §3 invariant 4) — it only asks the PMI to `allocate` one
//! when a connection needs to encrypt a packet, and to `release` or
//! `return_buf` it once the core is done, mirroring
//! `lsquic_packout_mem_if` / `stock_pmi`.

/// An opaque, PMI-owned buffer holding a packet's wire bytes (plaintext or
/// ciphertext).
#[derive(Debug)]
pub struct PacketBuf {
    data: Vec<u8>,
    is_ipv6: bool,
}

impl PacketBuf {
    pub fn new(data: Vec<u8>, is_ipv6: bool) -> Self {
        Self { data, is_ipv6 }
    }

    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Host-supplied allocator for packet buffers.
pub trait PacketMemory {
    /// Allocate a buffer of at least `size` bytes. `None` signals transient
    /// memory pressure (surfaces as [`crate::connection::EncryptOutcome::Nomem`]).
    fn allocate(&mut self, size: usize, is_ipv6: bool) -> Option<PacketBuf>;

    /// Release a buffer whose packet was sent successfully.
    fn release(&mut self, buf: PacketBuf, is_ipv6: bool);

    /// Return a buffer whose packet was *not* sent (e.g. the peer address
    /// changed and the connection must re-encrypt), for recycling.
    fn return_buf(&mut self, buf: PacketBuf, is_ipv6: bool);
}

/// A plain `Vec`-backed allocator with no recycling, equivalent to the
/// original's `stock_pmi` (`malloc`/`free` wrapped in the PMI shape). Useful
/// as a default for hosts and in tests.
#[derive(Debug, Default)]
pub struct HeapPacketMemory;

impl PacketMemory for HeapPacketMemory {
    fn allocate(&mut self, size: usize, is_ipv6: bool) -> Option<PacketBuf> {
        Some(PacketBuf::new(vec![0u8; size], is_ipv6))
    }

    fn release(&mut self, _buf: PacketBuf, _is_ipv6: bool) {}

    fn return_buf(&mut self, _buf: PacketBuf, _is_ipv6: bool) {}
}
