//! Typed errors for every fallible boundary the engine exposes.

use std::net::SocketAddr;

/// Returned by [`crate::settings::EngineSettings::validate`] and, in turn,
/// by [`crate::engine::Engine::new`].
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SettingsError {
    #[error("flow control window set too low: cfcw={cfcw}, sfcw={sfcw}, minimum is {minimum}")]
    FlowControlWindowTooLow { cfcw: u32, sfcw: u32, minimum: u32 },

    #[error("no supported QUIC versions specified")]
    NoSupportedVersions,

    #[error("one or more unsupported QUIC version bits set: {0:#x}")]
    UnsupportedVersionBits(u32),

    #[error("idle timeout of {0}s exceeds the maximum of 600s")]
    IdleTimeoutTooLarge(u32),

    #[error("source connection ID length {len} is invalid; it must be 0 (client-only) or between 4 and 18")]
    InvalidScidLen { len: u8 },

    #[error(
        "combined streams and placeholders ({sum}) exceeds the priority tree maximum of {max}"
    )]
    TooManyPriorityElements { sum: u32, max: u32 },
}

/// Returned by [`crate::engine::Engine::new`].
#[derive(Debug, thiserror::Error)]
pub enum NewEngineError {
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

/// Returned by [`crate::engine::Engine::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("engine is in server mode; `connect` is client-only")]
    ServerMode,

    #[error("local endpoint {0} already has a connection in by-endpoint mode")]
    PortInUse(SocketAddr),

    #[error("connection factory declined to create a connection")]
    FactoryRefused,
}

/// Returned by [`crate::ingress::dispatch_packet_in`] /
/// [`crate::engine::Engine::packet_in`].
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum IngressError {
    #[error("could not allocate an inbound packet descriptor")]
    OutOfMemory,

    #[error("failed to parse packet header")]
    ParseFailed,
}

/// What happened to a `packet_in` call over a (possibly coalesced) UDP
/// datagram buffer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IngressOutcome {
    /// At least one datagram was delivered to a live connection.
    Delivered,
    /// No datagram in the buffer found an owning connection.
    Unowned,
}

/// Returned by a host's [`crate::send::SendPackets::send`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transport error sending packets: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}
