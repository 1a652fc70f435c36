//! Exclusive ownership of one byte stream.
//!
//! A `Connection` is closed at most once: the first `close` shuts the write
//! half down and drops the stream, every later call is a no-op.

use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// A stream plus the address of the peer on the other end.
#[derive(Debug)]
pub struct Connection<S> {
    stream: Option<S>,
    peer: SocketAddr,
}

impl<S> Connection<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// The open stream, or `None` once closed.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Close the connection.
    ///
    /// Returns `true` if this call closed it and `false` if it was already
    /// closed. A failed shutdown still releases the stream.
    pub async fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        if let Err(e) = stream.shutdown().await {
            trace!(peer = %self.peer, error = %e, "Shutdown on close failed");
        }
        true
    }
}
