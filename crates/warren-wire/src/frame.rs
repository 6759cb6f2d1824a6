//! Frame encoding: magic + length + postcard payload.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{WireError, WireResult};

/// Frame magic: `WRN1`; protocol major version rides in the last byte.
pub const WIRE_MAGIC: u32 = u32::from_be_bytes(*b"WRN1");

/// Hard ceiling on one frame. Snapshots travel on the replication link,
/// not here, so RPC frames stay small.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Writes one framed value.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_allocvec(value).map_err(|e| WireError::Decode(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    writer.write_all(&WIRE_MAGIC.to_be_bytes()).await?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed value.
///
/// Returns [`WireError::ConnectionClosed`] on a clean EOF at a frame
/// boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> WireResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let magic = u32::from_be_bytes(header[0..4].try_into().expect("4-byte slice"));
    if magic != WIRE_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let len = u32::from_be_bytes(header[4..8].try_into().expect("4-byte slice"));
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| WireError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &("hello".to_string(), 42u64))
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (s, n): (String, u64) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(s, "hello");
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let mut buf = vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        buf.extend_from_slice(&[0u8; 4]);
        let mut cursor = std::io::Cursor::new(buf);
        let result: WireResult<String> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::BadMagic(_))));
    }

    #[tokio::test]
    async fn eof_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result: WireResult<String> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&WIRE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: WireResult<String> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }
}
