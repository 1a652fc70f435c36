//! Length-prefix framing shared by client and server.
//!
//! Every connection carries exactly one frame:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| payload (length bytes)    |
//! +----------------+---------------------------+
//! ```
//!
//! The length is the total payload size. The server never interprets the
//! payload, it only counts it.

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Encode a payload length as a big-endian header.
pub fn encode_header(length: u32) -> [u8; HEADER_LEN] {
    length.to_be_bytes()
}

/// Append a header to a buffer.
pub fn put_header<B: BufMut>(buf: &mut B, length: u32) {
    buf.put_u32(length);
}

/// Decode a header from the start of `bytes`.
///
/// Anything past the first four bytes is ignored.
pub fn decode_header(bytes: &[u8]) -> Result<u32, FrameError> {
    match bytes.get(..HEADER_LEN) {
        Some(&[a, b, c, d]) => Ok(u32::from_be_bytes([a, b, c, d])),
        _ => Err(FrameError::MalformedHeader {
            received: bytes.len(),
        }),
    }
}

/// Error from [`read_header`].
#[derive(Debug, Error)]
pub enum HeaderReadError {
    /// The stream ended before a full header arrived.
    #[error(transparent)]
    Malformed(#[from] FrameError),
    /// The stream failed.
    #[error("failed to read frame header: {0}")]
    Io(#[source] std::io::Error),
}

/// Read exactly one header from `reader`.
///
/// Returns `Malformed` if the peer closes the stream before four bytes have
/// been received. No bytes past the header are consumed.
pub async fn read_header<R>(reader: &mut R) -> Result<u32, HeaderReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(HeaderReadError::Io)?;
        if n == 0 {
            return Err(HeaderReadError::Malformed(FrameError::MalformedHeader {
                received: filled,
            }));
        }
        filled += n;
    }

    decode_header(&header).map_err(HeaderReadError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_test::io::Builder;

    #[test]
    fn test_header_round_trip() {
        for n in [0, 1, 255, 256, 1024 * 1024, u32::MAX - 1, u32::MAX] {
            assert_eq!(decode_header(&encode_header(n)).unwrap(), n);
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        assert_eq!(encode_header(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(decode_header(&[0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn test_put_header_matches_encode() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 1_048_576);
        assert_eq!(&buf[..], &encode_header(1_048_576));
    }

    #[test]
    fn test_decode_short_header() {
        assert_eq!(
            decode_header(&[0, 1, 2]),
            Err(FrameError::MalformedHeader { received: 3 })
        );
        assert_eq!(
            decode_header(&[]),
            Err(FrameError::MalformedHeader { received: 0 })
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode_header(&[0, 0, 0, 7, 0xff, 0xff]).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_read_header_across_partial_reads() {
        let mut io = Builder::new().read(&[0, 0]).read(&[0x10, 0x00]).build();
        assert_eq!(read_header(&mut io).await.unwrap(), 4096);
    }

    #[test]
    fn test_header_read_error_display() {
        let malformed = HeaderReadError::from(FrameError::MalformedHeader { received: 1 });
        assert_eq!(malformed.to_string(), "malformed frame header: got 1 of 4 bytes");

        let io = HeaderReadError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(io.to_string(), "failed to read frame header: reset");
        assert!(std::error::Error::source(&io).is_some());
    }

    #[tokio::test]
    async fn test_read_header_eof() {
        let mut io = Builder::new().read(&[0, 0, 1]).build();
        match read_header(&mut io).await {
            Err(HeaderReadError::Malformed(FrameError::MalformedHeader { received })) => {
                assert_eq!(received, 3)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_header_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let mut io = Builder::new().read(&[0]).read_error(err).build();
        match read_header(&mut io).await {
            Err(HeaderReadError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
