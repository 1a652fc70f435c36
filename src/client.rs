//! Client connector: pushes one framed payload to a server.
//!
//! A client owns at most one connection. `send_message` writes the 4-byte
//! header carrying the total payload length, then the payload in fixed-size
//! chunks, then closes the connection. There is no retry.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ClientSettings;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::frame;
use crate::stats::{Meter, TransferStats};

/// Default write chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Unit a transfer volume is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Bytes,
    Kib,
    Mib,
    #[default]
    Gib,
}

impl SizeUnit {
    pub fn multiplier(self) -> u64 {
        match self {
            SizeUnit::Bytes => 1,
            SizeUnit::Kib => 1 << 10,
            SizeUnit::Mib => 1 << 20,
            SizeUnit::Gib => 1 << 30,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeUnit::Bytes => "bytes",
            SizeUnit::Kib => "KiB",
            SizeUnit::Mib => "MiB",
            SizeUnit::Gib => "GiB",
        }
    }
}

/// An amount of data to send, e.g. 2 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    pub amount: u64,
    pub unit: SizeUnit,
}

impl Volume {
    pub fn new(amount: u64, unit: SizeUnit) -> Self {
        Self { amount, unit }
    }

    pub fn bytes(amount: u32) -> Self {
        Self::new(u64::from(amount), SizeUnit::Bytes)
    }

    /// Total byte count, which must fit in the frame header.
    pub fn to_bytes(self) -> Result<u32, ClientError> {
        self.amount
            .checked_mul(self.unit.multiplier())
            .and_then(|total| u32::try_from(total).ok())
            .ok_or(ClientError::Overflow {
                amount: self.amount,
                unit: self.unit.name(),
            })
    }
}

/// Outbound side of the benchmark.
#[derive(Debug)]
pub struct Client {
    target: String,
    chunk_size: usize,
    conn: Option<Connection<TcpStream>>,
}

impl Client {
    /// Create a client for `target` (host:port).
    pub fn new(target: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            target: target.into(),
            chunk_size: chunk_size.max(1),
            conn: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Open the connection. Does nothing if already connected.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        let connect_err = |source| ClientError::Connect {
            target: self.target.clone(),
            source,
        };
        let stream = TcpStream::connect(&self.target).await.map_err(connect_err)?;
        let peer = stream.peer_addr().map_err(connect_err)?;

        debug!(peer = %peer, "Connected");
        self.conn = Some(Connection::new(stream, peer));
        Ok(())
    }

    /// Close the connection. Returns `false` if there was nothing to close.
    pub async fn stop(&mut self) -> bool {
        match self.conn.take() {
            Some(mut conn) => conn.close().await,
            None => false,
        }
    }

    /// Send `volume` bytes as a single frame and close the connection.
    ///
    /// The volume is checked before any I/O. On a failed write the
    /// connection is still closed and the partial statistics are carried by
    /// [`ClientError::Transfer`].
    pub async fn send_message(&mut self, volume: Volume) -> Result<TransferStats, ClientError> {
        let total = volume.to_bytes()?;

        let mut conn = match self.conn.take() {
            Some(conn) if !conn.is_closed() => conn,
            _ => return Err(ClientError::NotConnected),
        };
        let peer = conn.peer();
        let Some(stream) = conn.stream_mut() else {
            return Err(ClientError::NotConnected);
        };

        let chunk = zeroed_chunk(self.chunk_size.min(total as usize));
        let mut meter = Meter::start();
        let result = write_frame(stream, total, &chunk, &mut meter).await;
        let stats = meter.finish();

        conn.close().await;
        report_sent(peer, &stats, result.is_ok());

        match result {
            Ok(()) => Ok(stats),
            Err(source) => Err(ClientError::Transfer {
                peer,
                stats,
                source,
            }),
        }
    }
}

fn zeroed_chunk(len: usize) -> Bytes {
    BytesMut::zeroed(len).freeze()
}

/// Write the header for `total` and then `total` payload bytes from `chunk`.
async fn write_frame<W>(
    writer: &mut W,
    total: u32,
    chunk: &[u8],
    meter: &mut Meter,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame::encode_header(total)).await?;

    // Count every byte the stream accepts, so a failed chunk still shows
    // up in the partial statistics
    let mut remaining = total as usize;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        let written = writer.write(&chunk[..n]).await?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        meter.add(written);
        remaining -= written;
    }

    writer.flush().await
}

fn report_sent(peer: SocketAddr, stats: &TransferStats, ok: bool) {
    if ok {
        info!(
            peer = %peer,
            bytes = stats.bytes,
            seconds = stats.elapsed_secs(),
            mib_per_sec = stats.mib_per_sec(),
            "Transfer finished"
        );
    } else {
        warn!(
            peer = %peer,
            bytes = stats.bytes,
            seconds = stats.elapsed_secs(),
            "Transfer aborted"
        );
    }
}

/// Run `settings.clients` clients concurrently against the same target.
///
/// Results come back in client order. Each client connects, sends one
/// frame and is closed whether or not the transfer succeeded.
pub async fn run_clients(settings: &ClientSettings) -> Vec<Result<TransferStats, ClientError>> {
    let mut handles = Vec::with_capacity(settings.clients);

    for id in 0..settings.clients {
        let mut client = Client::new(settings.target.clone(), settings.chunk_size);
        let volume = settings.volume;

        let task = async move {
            let result = match client.connect().await {
                Ok(()) => client.send_message(volume).await,
                Err(e) => Err(e),
            };
            client.stop().await;
            if let Err(ref e) = result {
                warn!(error = %e, "Client failed");
            }
            result
        };
        handles.push(tokio::spawn(task.instrument(info_span!("client", id))));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_header;
    use tokio_test::io::Builder;

    #[test]
    fn test_volume_to_bytes() {
        assert_eq!(Volume::new(0, SizeUnit::Gib).to_bytes().unwrap(), 0);
        assert_eq!(Volume::new(3, SizeUnit::Kib).to_bytes().unwrap(), 3072);
        assert_eq!(Volume::new(1, SizeUnit::Gib).to_bytes().unwrap(), 1 << 30);
        assert_eq!(Volume::bytes(u32::MAX).to_bytes().unwrap(), u32::MAX);
    }

    #[test]
    fn test_volume_overflow() {
        assert!(matches!(
            Volume::new(4, SizeUnit::Gib).to_bytes(),
            Err(ClientError::Overflow { amount: 4, unit: "GiB" })
        ));
        // Overflows u64 before the u32 check
        assert!(matches!(
            Volume::new(u64::MAX, SizeUnit::Mib).to_bytes(),
            Err(ClientError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_overflow_checked_before_connection() {
        let mut client = Client::new("127.0.0.1:1", DEFAULT_CHUNK_SIZE);
        let err = client
            .send_message(Volume::new(20, SizeUnit::Gib))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Overflow { amount: 20, .. }));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let mut client = Client::new("127.0.0.1:1", DEFAULT_CHUNK_SIZE);
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_message(Volume::bytes(10)).await,
            Err(ClientError::NotConnected)
        ));
        assert!(!client.stop().await);
    }

    #[tokio::test]
    async fn test_write_frame_chunks_payload() {
        let mut io = Builder::new()
            .write(&encode_header(10))
            .write(&[0u8; 4])
            .write(&[0u8; 4])
            .write(&[0u8; 2])
            .build();

        let mut meter = Meter::start();
        write_frame(&mut io, 10, &[0u8; 4], &mut meter).await.unwrap();
        assert_eq!(meter.bytes(), 10);
    }

    #[tokio::test]
    async fn test_write_frame_empty_payload() {
        let mut io = Builder::new().write(&encode_header(0)).build();

        let mut meter = Meter::start();
        write_frame(&mut io, 0, &[], &mut meter).await.unwrap();
        assert_eq!(meter.bytes(), 0);
    }

    #[tokio::test]
    async fn test_write_frame_error_keeps_partial_count() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let mut io = Builder::new()
            .write(&encode_header(10))
            .write(&[0u8; 4])
            .write_error(err)
            .build();

        let mut meter = Meter::start();
        let res = write_frame(&mut io, 10, &[0u8; 4], &mut meter).await;
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(meter.bytes(), 4);
    }

    #[tokio::test]
    async fn test_write_frame_counts_partial_chunk() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let mut io = Builder::new()
            .write(&encode_header(8))
            .write(&[0u8; 3])
            .write_error(err)
            .build();

        let mut meter = Meter::start();
        let res = write_frame(&mut io, 8, &[0u8; 8], &mut meter).await;
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(meter.bytes(), 3);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = Client::new(addr.to_string(), DEFAULT_CHUNK_SIZE);
        match client.connect().await {
            Err(ClientError::Connect { target, .. }) => assert_eq!(target, addr.to_string()),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!client.is_connected());
    }
}
