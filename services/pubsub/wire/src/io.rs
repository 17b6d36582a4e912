//! Moving connection headers over a byte stream.
//!
//! Only framing lives here: the stream itself is opened and owned by the
//! transport layer.

use crate::error::HeaderIoError;
use crate::header::{ConnectionHeader, LEN_PREFIX_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Largest header accepted from a peer (1 MiB)
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Write a header to the stream.
///
/// An all-absent header writes nothing.
pub async fn write_header<W: AsyncWriteExt + Unpin>(
    mut writer: W,
    header: &ConnectionHeader,
) -> Result<(), HeaderIoError> {
    let bytes = header.to_bytes()?;
    if bytes.is_empty() {
        return Ok(());
    }

    writer.write_all(&bytes).await?;
    writer.flush().await?;
    debug!("Sent connection header ({} bytes)", bytes.len());
    Ok(())
}

/// Read one header from the stream.
///
/// Reads the total length prefix and then exactly that many bytes, so the
/// stream is left positioned at the first byte after the header.
///
/// A stream that ends before any byte of the prefix yields the all-absent
/// header, mirroring `write_header` writing nothing for it. A stream that
/// ends inside the prefix or the body is an `UnexpectedEof` I/O error.
pub async fn read_header<R: AsyncReadExt + Unpin>(
    mut reader: R,
) -> Result<ConnectionHeader, HeaderIoError> {
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LEN_PREFIX_SIZE {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => {
                debug!("Stream ended before a connection header, treating it as empty");
                return Ok(ConnectionHeader::default());
            }
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside the header length prefix",
                )
                .into())
            }
            n => filled += n,
        }
    }

    let total = u32::from_le_bytes(prefix) as usize;
    if total > MAX_HEADER_SIZE {
        return Err(HeaderIoError::TooLarge(total));
    }

    let mut frame = vec![0u8; LEN_PREFIX_SIZE + total];
    frame[..LEN_PREFIX_SIZE].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[LEN_PREFIX_SIZE..]).await?;

    let header = ConnectionHeader::decode(&frame)?;
    debug!("Received connection header ({} bytes)", frame.len());
    Ok(header)
}
