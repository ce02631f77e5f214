//! Label types attached to the engine's counters and histograms.

use std::fmt;

/// Why an ingress datagram never reached a connection's `packet_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDropReason {
    /// No registry entry matched the datagram's CID/endpoint.
    NoOwner,
    /// The header parser rejected the datagram.
    ParseFailed,
    /// No packet-memory descriptor was available.
    OutOfMemory,
}

impl fmt::Display for IngressDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOwner => "no_owner",
            Self::ParseFailed => "parse_failed",
            Self::OutOfMemory => "out_of_memory",
        };
        f.write_str(s)
    }
}

/// Why a batch of outgoing packets was not fully accepted by the host's
/// `packets_out` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureReason {
    /// The callback returned fewer accepted packets than offered.
    Partial,
    /// The callback returned an error.
    Transport,
}

impl fmt::Display for SendFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Partial => "partial",
            Self::Transport => "transport",
        };
        f.write_str(s)
    }
}
