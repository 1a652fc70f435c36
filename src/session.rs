//! Server-side session: drains one accepted connection.
//!
//! ```text
//! Created --header ok--> Reading --eof/cancel/error--> Completed
//!    |                                                    ^
//!    +--short header--> Failed ---------------------------+
//! ```
//!
//! The session reads the 4-byte header, then reads into a single reusable
//! buffer until the peer closes the stream or the pool cancels it. The
//! header is informational: the report carries the number of bytes that
//! actually arrived, which may differ from the declared length.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::SessionError;
use crate::frame::{self, HeaderReadError};
use crate::stats::{Meter, SessionOutcome, SessionReport};

/// Default read buffer size (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the frame header.
    Created,
    /// Header accepted, draining payload.
    Reading,
    /// Header was malformed or unreadable.
    Failed,
    /// Connection closed and buffer released.
    Completed,
}

/// One accepted connection and the state needed to drain it.
pub struct Session<S> {
    conn: Connection<S>,
    buffer: BytesMut,
    state: SessionState,
    cancel: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session over `stream`.
    ///
    /// The session stops reading as soon as `cancel` becomes `true`.
    pub fn new(
        stream: S,
        peer: SocketAddr,
        buffer_size: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            conn: Connection::new(stream, peer),
            buffer: BytesMut::with_capacity(buffer_size),
            state: SessionState::Created,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Created | SessionState::Reading)
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn close(&mut self) -> bool {
        self.conn.close().await
    }

    /// Drive the session to completion and return its report.
    ///
    /// The connection is closed and the buffer released before returning,
    /// whichever way the session ends.
    pub async fn run(&mut self) -> SessionReport {
        let mut meter = Meter::start();

        let (declared, outcome) = match self.read_header().await {
            Ok(Some(length)) => {
                self.state = SessionState::Reading;
                trace!(peer = %self.peer(), declared = length, "Header received");
                (Some(length), self.drain(&mut meter).await)
            }
            Ok(None) => (None, SessionOutcome::Cancelled),
            Err(e) => {
                self.state = SessionState::Failed;
                warn!(peer = %self.peer(), error = %e, "Aborting session");
                (None, SessionOutcome::Failed(e))
            }
        };

        let stats = meter.finish();
        if let Some(length) = declared {
            if stats.bytes != u64::from(length) && outcome.is_completed() {
                debug!(
                    peer = %self.peer(),
                    declared = length,
                    received = stats.bytes,
                    "Payload length differs from header"
                );
            }
        }

        self.teardown().await;

        SessionReport {
            peer: self.peer(),
            declared,
            stats,
            outcome,
        }
    }

    /// Returns `Ok(None)` if cancelled before the header arrived.
    async fn read_header(&mut self) -> Result<Option<u32>, SessionError> {
        let Some(stream) = self.conn.stream_mut() else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Ok(None),
            res = frame::read_header(stream) => match res {
                Ok(length) => Ok(Some(length)),
                Err(HeaderReadError::Malformed(e)) => Err(e.into()),
                Err(HeaderReadError::Io(source)) => Err(SessionError::Transfer {
                    received: 0,
                    source,
                }),
            },
        }
    }

    async fn drain(&mut self, meter: &mut Meter) -> SessionOutcome {
        let Some(stream) = self.conn.stream_mut() else {
            return SessionOutcome::Completed;
        };

        loop {
            self.buffer.clear();
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return SessionOutcome::Cancelled,
                res = stream.read_buf(&mut self.buffer) => match res {
                    Ok(0) => return SessionOutcome::Completed,
                    Ok(n) => meter.add(n),
                    Err(source) => {
                        return SessionOutcome::Failed(SessionError::Transfer {
                            received: meter.bytes(),
                            source,
                        })
                    }
                },
            }
        }
    }

    async fn teardown(&mut self) {
        if self.conn.close().await {
            trace!(peer = %self.peer(), "Connection closed");
        }
        self.buffer = BytesMut::new();
        self.state = SessionState::Completed;
    }
}

/// Resolves once cancellation is requested.
///
/// A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let sender_gone = cancel.wait_for(|c| *c).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::frame::encode_header;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_drains_full_payload() {
        let (_tx, rx) = watch::channel(false);
        let io = Builder::new()
            .read(&encode_header(10))
            .read(b"hello")
            .read(b"world")
            .build();

        let mut session = Session::new(io, peer(), 64, rx);
        assert_eq!(session.state(), SessionState::Created);

        let report = session.run().await;
        assert!(report.outcome.is_completed());
        assert_eq!(report.declared, Some(10));
        assert_eq!(report.stats.bytes, 10);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_reports_observed_count_not_declared() {
        let (_tx, rx) = watch::channel(false);
        let io = Builder::new()
            .read(&encode_header(1000))
            .read(&[7u8; 300])
            .build();

        let mut session = Session::new(io, peer(), 128, rx);
        let report = session.run().await;
        assert!(report.outcome.is_completed());
        assert_eq!(report.declared, Some(1000));
        assert_eq!(report.stats.bytes, 300);
    }

    #[tokio::test]
    async fn test_short_header_fails_and_closes_once() {
        let (_tx, rx) = watch::channel(false);
        let io = Builder::new().read(&[0, 0]).build();

        let mut session = Session::new(io, peer(), 64, rx);
        let report = session.run().await;

        assert!(matches!(
            report.outcome,
            SessionOutcome::Failed(SessionError::Frame(FrameError::MalformedHeader {
                received: 2
            }))
        ));
        assert_eq!(report.declared, None);
        assert_eq!(report.stats.bytes, 0);
        assert_eq!(session.state(), SessionState::Completed);
        // Already closed by the session; closing again does nothing
        assert!(!session.close().await);
    }

    #[tokio::test]
    async fn test_read_error_keeps_partial_count() {
        let (_tx, rx) = watch::channel(false);
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let io = Builder::new()
            .read(&encode_header(100))
            .read(&[1u8; 40])
            .read_error(err)
            .build();

        let mut session = Session::new(io, peer(), 64, rx);
        let report = session.run().await;

        match report.outcome {
            SessionOutcome::Failed(SessionError::Transfer { received, .. }) => {
                assert_eq!(received, 40)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(report.stats.bytes, 40);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_read() {
        let (tx, rx) = watch::channel(false);
        let (server_side, mut client_side) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            let mut session = Session::new(server_side, peer(), 256, rx);
            let report = session.run().await;
            (report, session.state())
        });

        client_side.write_all(&encode_header(1 << 20)).await.unwrap();
        client_side.write_all(&[0u8; 100]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send_replace(true);
        let (report, state) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not observe cancellation")
            .unwrap();

        assert!(matches!(report.outcome, SessionOutcome::Cancelled));
        assert_eq!(report.stats.bytes, 100);
        assert_eq!(state, SessionState::Completed);

        // Server side of the stream is gone
        let mut buf = [0u8; 1];
        assert_eq!(
            tokio::io::AsyncReadExt::read(&mut client_side, &mut buf)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_cancel_before_header() {
        let (tx, rx) = watch::channel(true);
        let (server_side, _client_side) = tokio::io::duplex(64);

        let mut session = Session::new(server_side, peer(), 64, rx);
        let report = session.run().await;
        drop(tx);

        assert!(matches!(report.outcome, SessionOutcome::Cancelled));
        assert_eq!(report.declared, None);
    }
}
