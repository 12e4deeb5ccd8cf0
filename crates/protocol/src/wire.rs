//! Length-prefixed negotiation fields.
//!
//! Every field is a 4-byte big-endian length followed by that many bytes.
//! Readers enforce a cap before allocating, since these fields arrive from
//! peers that have not authenticated yet.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Maximum accepted size of a single negotiation field (100 KiB).
pub const MAX_FIELD_SIZE: usize = 100 * 1024;

/// Writes a length-prefixed byte block and flushes.
pub async fn write_block<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > MAX_FIELD_SIZE {
        return Err(ProtocolError::FieldTooLarge {
            size: data.len(),
            max: MAX_FIELD_SIZE,
        });
    }

    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-prefixed byte block of at most `max` bytes.
pub async fn read_block<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader
        .read_u32()
        .await
        .map_err(|e| ProtocolError::truncated(e, "field"))? as usize;
    if len > max {
        return Err(ProtocolError::FieldTooLarge { size: len, max });
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| ProtocolError::truncated(e, "field"))?;
    Ok(data)
}

/// Writes a length-prefixed UTF-8 string.
pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_block(writer, value.as_bytes()).await
}

/// Reads a length-prefixed UTF-8 string of at most `max` bytes.
pub async fn read_string<R>(reader: &mut R, max: usize) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let data = read_block(reader, max).await?;
    String::from_utf8(data)
        .map_err(|e| ProtocolError::Deserialization(format!("field is not valid UTF-8: {e}")))
}

/// Reads a block for a negotiation step.
///
/// Returns `Ok(None)` when the peer sent something a step must reject
/// (an empty or oversized field). Transport failures stay errors.
pub async fn read_field<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_block(reader, MAX_FIELD_SIZE).await {
        Ok(data) if data.is_empty() => Ok(None),
        Ok(data) => Ok(Some(data)),
        Err(ProtocolError::FieldTooLarge { size, max }) => {
            tracing::debug!(size, max, "Peer sent oversized negotiation field");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// String flavour of [`read_field`]; invalid UTF-8 also yields `Ok(None)`.
pub async fn read_string_field<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(read_field(reader)
        .await?
        .and_then(|data| String::from_utf8(data).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_block(&mut a, &[1, 2, 3]).await.unwrap();
        let data = read_block(&mut b, MAX_FIELD_SIZE).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_block_layout_is_big_endian_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_block(&mut a, b"abc").await.unwrap();
        let mut raw = [0u8; 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_string_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_string(&mut a, "héllo").await.unwrap();
        let s = read_string(&mut b, MAX_FIELD_SIZE).await.unwrap();
        assert_eq!(s, "héllo");
    }

    #[tokio::test]
    async fn test_oversized_announcement_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = read_block(&mut b, MAX_FIELD_SIZE).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldTooLarge {
                size,
                max: MAX_FIELD_SIZE
            } if size == u32::MAX as usize
        ));
    }

    #[tokio::test]
    async fn test_write_refuses_oversized_block() {
        let (mut a, _b) = tokio::io::duplex(16);
        let big = vec![0u8; MAX_FIELD_SIZE + 1];
        let err = write_block(&mut a, &big).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FieldTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_deserialization_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_block(&mut a, &[0xFF, 0xFE]).await.unwrap();
        let err = read_string(&mut b, MAX_FIELD_SIZE).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[tokio::test]
    async fn test_truncated_block_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2]).await.unwrap();
        drop(a);
        let err = read_block(&mut b, MAX_FIELD_SIZE).await.unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_read_field_maps_blank_and_oversized_to_none() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_block(&mut a, &[]).await.unwrap();
        assert_eq!(read_field(&mut b).await.unwrap(), None);

        a.write_all(&((MAX_FIELD_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        assert_eq!(read_field(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_string_field_maps_invalid_utf8_to_none() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_block(&mut a, &[0xC3]).await.unwrap();
        assert_eq!(read_string_field(&mut b).await.unwrap(), None);

        write_string(&mut a, "token").await.unwrap();
        assert_eq!(
            read_string_field(&mut b).await.unwrap(),
            Some("token".to_string())
        );
    }
}
