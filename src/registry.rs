//! Connection Registry (C1): the hash lookup from a wire-visible key (a
//! connection ID, or in by-endpoint mode the local port) to the owning
//! connection's slot, plus the separate stateless-reset token index. Mirrors
//! `lsquic_engine.c`'s `conns_hash` and `el_attq`-adjacent `cces_hash`.

use fnv::FnvHashMap;
use std::net::SocketAddr;

use crate::connection::ConnId;
use crate::settings::RegistryMode;

/// Maps connection-visible keys to [`ConnId`]s.
///
/// Two independent tables back the two [`RegistryMode`]s: `by_cid` for
/// CID-keyed lookup (used directly in [`RegistryMode::ByConnectionId`], and
/// still consulted for trial decryption / stateless-reset adjacent paths
/// even in endpoint mode), and `by_port` for [`RegistryMode::ByEndpoint`],
/// which keys by the 16-bit local port alone -- "at most one connection per
/// local endpoint" (spec: the key is the local port extracted from the
/// stored sockaddr, not the full 4-tuple).
#[derive(Debug)]
pub struct ConnectionRegistry {
    mode: RegistryMode,
    by_cid: FnvHashMap<Vec<u8>, ConnId>,
    by_port: FnvHashMap<u16, ConnId>,
    by_reset_token: FnvHashMap<[u8; 16], ConnId>,
}

impl ConnectionRegistry {
    pub fn new(mode: RegistryMode) -> Self {
        Self {
            mode,
            by_cid: FnvHashMap::default(),
            by_port: FnvHashMap::default(),
            by_reset_token: FnvHashMap::default(),
        }
    }

    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    /// Registers `conn` under connection ID `cid`.
    pub fn insert_by_cid(&mut self, cid: &[u8], conn: ConnId) -> bool {
        self.by_cid.insert(cid.to_vec(), conn).is_none()
    }

    /// Registers `conn` under its local port. `peer` is accepted but not
    /// part of the key, matching the "local port only" endpoint-mode
    /// contract; callers still pass it so future multi-homed variants of
    /// this mode have somewhere to grow into without changing the call
    /// sites.
    pub fn insert_by_endpoint(&mut self, local: SocketAddr, _peer: SocketAddr, conn: ConnId) -> bool {
        self.by_port.insert(local.port(), conn).is_none()
    }

    pub fn remove_by_cid(&mut self, cid: &[u8]) -> Option<ConnId> {
        self.by_cid.remove(cid)
    }

    pub fn remove_by_endpoint(&mut self, local: SocketAddr, _peer: SocketAddr) -> Option<ConnId> {
        self.by_port.remove(&local.port())
    }

    pub fn lookup_by_cid(&self, cid: &[u8]) -> Option<ConnId> {
        self.by_cid.get(cid).copied()
    }

    pub fn lookup_by_endpoint(&self, local: SocketAddr, _peer: SocketAddr) -> Option<ConnId> {
        self.by_port.get(&local.port()).copied()
    }

    /// `true` iff `local`'s port is already claimed, regardless of which
    /// peer would be paired with it -- the check `connect()` uses to refuse
    /// a second connection on the same local endpoint.
    pub fn port_in_use(&self, local: SocketAddr) -> bool {
        self.by_port.contains_key(&local.port())
    }

    pub fn insert_reset_token(&mut self, token: [u8; 16], conn: ConnId) -> bool {
        self.by_reset_token.insert(token, conn).is_none()
    }

    pub fn remove_reset_token(&mut self, token: &[u8; 16]) -> Option<ConnId> {
        self.by_reset_token.remove(token)
    }

    pub fn lookup_by_reset_token(&self, token: &[u8; 16]) -> Option<ConnId> {
        self.by_reset_token.get(token).copied()
    }

    /// Drops every key registered for `conn`. Called on connection
    /// destruction; O(n) in the number of CIDs the connection holds (bounded
    /// by [`crate::connection::MAX_CCES`]), not in registry size.
    pub fn remove_all_cids(&mut self, cids: impl Iterator<Item = Vec<u8>>) {
        for cid in cids {
            self.by_cid.remove(&cid);
        }
    }

    pub fn len(&self) -> usize {
        self.by_cid.len() + self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cid.is_empty() && self.by_port.is_empty()
    }
}
