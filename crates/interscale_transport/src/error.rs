//! Transport error types.

use std::io;

use interscale_core::{BufferError, HandshakeError};
use thiserror::Error;

use crate::wire::WireError;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer went away without sending a terminal message.
    #[error("peer {peer} disconnected")]
    Disconnected {
        /// Human readable peer description.
        peer: String,
    },

    /// The link was already closed on this side or aborted by the peer.
    #[error("transport closed")]
    Closed,

    /// Endpoint discovery failed.
    #[error("endpoint discovery: {0}")]
    Handshake(#[from] HandshakeError),

    /// The published endpoint is not a socket address.
    #[error("invalid endpoint record `{0}`")]
    InvalidEndpoint(String),

    /// Framing error on the link.
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Socket error.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl From<BufferError> for TransportError {
    fn from(_: BufferError) -> Self {
        Self::Closed
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
