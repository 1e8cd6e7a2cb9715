use gearshift_protocol::{PacketType, ProtocolError};
use thiserror::Error;

/// Transport-level failures talking to a Gearman job server.
///
/// A job that ran and failed is not a `BrokerError`; it comes back as a
/// [`crate::client::DispatchStatus`].
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("No reachable job server among [{servers}]")]
    Unreachable { servers: String },

    #[error("Job server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Unexpected {kind:?} packet from job server")]
    UnexpectedPacket { kind: PacketType },

    #[error("Connection closed by job server")]
    Closed,

    /// A job asked the worker to stop.
    #[error("Job '{job}' aborted the worker: {reason}")]
    JobAborted { job: String, reason: String },
}
