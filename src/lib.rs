//! Single-threaded cooperative multiplexer for a population of QUIC
//! connections: ingresses UDP datagrams to the right connection, drives
//! each one forward in time, and egresses packets in pacing-friendly
//! batches. The handshake, loss recovery, stream multiplexing, and crypto
//! session live behind the narrow [`connection::Connection`] capability;
//! this crate only schedules.

pub mod attq;
pub mod clock;
pub mod connection;
pub mod egress;
pub mod engine;
pub mod error;
pub mod handle;
pub mod heap;
pub mod ingress;
pub mod membership;
pub mod metrics;
pub mod parser;
pub mod pmi;
pub mod registry;
pub mod send;
pub mod settings;

#[cfg(feature = "tokio-driver")]
pub mod driver;

pub use connection::{Connection, ConnId, ConnectionFactory};
pub use engine::{Engine, EngineStats};
pub use error::{ConnectError, IngressError, IngressOutcome, NewEngineError, SendError, SettingsError};
pub use handle::EngineHandle;
pub use settings::EngineSettings;
