//! Error types for byte-drain.
//!
//! Each concern gets its own enum so callers can tell a refused connect
//! apart from a connection that dropped halfway through a transfer.

use std::net::SocketAddr;

use thiserror::Error;

use crate::stats::TransferStats;

/// Frame header decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer than 4 bytes were available for the length prefix.
    #[error("malformed frame header: got {received} of 4 bytes")]
    MalformedHeader { received: usize },
}

/// Reasons a server-side session ended without completing.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Stream failure while reading the header or payload.
    #[error("transfer failed after {received} bytes: {source}")]
    Transfer {
        received: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Session pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has started shutting down and accepts no more sessions.
    #[error("session pool is shut down")]
    Shutdown,
}

/// Connection acceptor errors.
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// The listening socket could not be created or bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// `accept()` failed while the server was still running.
    #[error("failed to accept client connection: {0}")]
    Accept(#[source] std::io::Error),
}

/// Client connector errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The outbound connection could not be established.
    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// `send_message` was called without an open connection.
    #[error("no connection to server")]
    NotConnected,

    /// The requested volume does not fit in the 4-byte length header.
    #[error("requested volume of {amount} {unit} exceeds the maximum frame size")]
    Overflow { amount: u64, unit: &'static str },

    /// The connection failed partway through sending.
    #[error("connection to {peer} dropped after sending {} bytes: {source}", .stats.bytes)]
    Transfer {
        peer: SocketAddr,
        stats: TransferStats,
        #[source]
        source: std::io::Error,
    },
}
