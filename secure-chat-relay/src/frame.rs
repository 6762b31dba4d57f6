use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the single read that makes up one frame.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Reads one frame: whatever a single `read` call returns.
///
/// There is no length prefix. A message larger than `buf` is split across
/// frames and two messages sent back to back may arrive as one.
/// `Ok(None)` means the peer closed its side.
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let bytes = reader.read(buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&buf[..bytes]).into_owned()))
}

pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}
