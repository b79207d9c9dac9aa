//! Engine error taxonomy
//!
//! None of these crash the node process: handshake errors abort the current
//! bootstrap call, peer I/O errors tear down that one peer record, and
//! authentication failures drop the offending message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The rendezvous connect did not complete in time. The caller decides
    /// whether to retry the whole call.
    #[error("connect timed out")]
    TransportTimeout,

    /// The received code did not match the handshake state machine's
    /// expectation.
    #[error("protocol violation: expected code {expected}, received {received}")]
    ProtocolViolation { expected: u16, received: u16 },

    /// A response was missing a required body field.
    #[error("missing required field in code {code} response")]
    MissingField { code: u16 },

    /// The remote reported a protocol version below the minimum supported.
    #[error("unsupported remote version {0}")]
    UnsupportedVersion(String),

    /// The join connected zero peers; the node cannot participate.
    #[error("no peers could be connected")]
    NoPeers,

    #[error("no bootstrap servers configured")]
    NoBootstrap,

    #[error("malformed line: {0}")]
    Malformed(#[from] crate::protocol::message::ParseError),

    /// Signature or freshness check failed on an inbound message.
    #[error("authentication failure: {0}")]
    Authentication(#[from] crate::keys::KeyError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
