//! Frames carrying one envelope each.
//!
//! ```text
//! "DPLK" | u32 BE content length | flags | payload
//! ```
//!
//! The content length counts the flags byte and the payload. Bit 0 of the
//! flags marks an LZ4 payload (size-prepended); payloads over 1 KiB are
//! compressed when that makes them smaller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DPLK";

/// Largest frame accepted or produced, prefix included (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Magic plus length.
const PREFIX_SIZE: usize = 8;

const COMPRESSION_THRESHOLD: usize = 1024;

/// Flags byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }
}

/// One decoded frame; the payload is always uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// Reads and writes [`Frame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serializes `frame`, compressing large payloads.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;
        let compressed = (payload.len() > COMPRESSION_THRESHOLD)
            .then(|| lz4_flex::compress_prepend_size(payload))
            .filter(|packed| packed.len() < payload.len());

        let (flags, body) = match &compressed {
            Some(packed) => (FrameFlags::COMPRESSED, packed.as_slice()),
            None => (0, payload.as_slice()),
        };

        let content_len = 1 + body.len();
        let size = PREFIX_SIZE + content_len;
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&(content_len as u32).to_be_bytes());
        out.push(flags);
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Writes one frame and flushes.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one frame.
    ///
    /// `Ok(None)` means the peer closed cleanly between frames. EOF inside a
    /// frame is [`ProtocolError::ConnectionClosed`].
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; PREFIX_SIZE];
        if reader.read(&mut prefix[..1]).await? == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut prefix[1..])
            .await
            .map_err(|e| ProtocolError::truncated(e, "frame"))?;

        let content_len = parse_prefix(&prefix)?;
        let mut content = vec![0u8; content_len];
        reader
            .read_exact(&mut content)
            .await
            .map_err(|e| ProtocolError::truncated(e, "frame"))?;
        decode_content(&content).map(Some)
    }
}

/// Checks magic and size, returning the content length.
fn parse_prefix(prefix: &[u8; PREFIX_SIZE]) -> Result<usize> {
    if prefix[..4] != FRAME_MAGIC {
        return Err(ProtocolError::InvalidFrame(format!(
            "invalid frame magic {:02x?}",
            &prefix[..4]
        )));
    }

    let content_len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if content_len == 0 {
        return Err(ProtocolError::InvalidFrame("frame has no flags byte".into()));
    }
    Ok(content_len)
}

fn decode_content(content: &[u8]) -> Result<Frame> {
    let Some((&flags, body)) = content.split_first() else {
        return Err(ProtocolError::InvalidFrame("frame has no flags byte".into()));
    };

    if !FrameFlags::from_byte(flags).is_compressed() {
        return Ok(Frame::new(body.to_vec()));
    }

    // Check the announced size before lz4 allocates for it.
    if let Some(&[a, b, c, d]) = body.get(..4) {
        let announced = u32::from_le_bytes([a, b, c, d]) as usize;
        if announced > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "compressed payload announces {announced} bytes"
            )));
        }
    }
    lz4_flex::decompress_size_prepended(body)
        .map(Frame::new)
        .map_err(|e| ProtocolError::InvalidFrame(format!("failed to decompress payload: {e}")))
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn raw_frame(flags: u8, body: &[u8]) -> Vec<u8> {
        let mut out = FRAME_MAGIC.to_vec();
        out.extend_from_slice(&(1 + body.len() as u32).to_be_bytes());
        out.push(flags);
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_clean_eof() {
        let codec = FrameCodec::new();
        let (mut a, mut b) = duplex(64 * 1024);

        let text = b"{\"tag\":\"Hello\"}".to_vec();
        let log: Vec<u8> = "line of terminal output\n".repeat(200).into_bytes();
        codec.write_frame(&mut a, &Frame::new(text.clone())).await.unwrap();
        codec.write_frame(&mut a, &Frame::new(log.clone())).await.unwrap();
        drop(a);

        assert_eq!(codec.read_frame(&mut b).await.unwrap().unwrap().payload, text);
        assert_eq!(codec.read_frame(&mut b).await.unwrap().unwrap().payload, log);
        assert!(codec.read_frame(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn test_small_payload_goes_out_verbatim() {
        let encoded = FrameCodec::new().encode(&Frame::new(vec![0xDE, 0xAD])).unwrap();
        assert_eq!(encoded, raw_frame(0, &[0xDE, 0xAD]));
    }

    #[tokio::test]
    async fn test_large_repetitive_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload = vec![b'a'; 8 * 1024];
        let encoded = codec.encode(&Frame::new(payload.clone())).unwrap();

        assert!(FrameFlags::from_byte(encoded[PREFIX_SIZE]).is_compressed());
        assert!(encoded.len() < payload.len());

        let frame = codec.read_frame(&mut encoded.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_incompressible_payload_is_left_alone() {
        let mut state = 0x2545_F491u32;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let encoded = FrameCodec::new().encode(&Frame::new(payload.clone())).unwrap();
        assert_eq!(encoded, raw_frame(0, &payload));
    }

    #[test]
    fn test_encode_refuses_oversized_payload() {
        let mut state = 7u64;
        let payload: Vec<u8> = (0..MAX_FRAME_SIZE)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect();
        let err = FrameCodec::new().encode(&Frame::new(payload)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_magic() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();

        let err = FrameCodec::new().read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length_before_reading_body() {
        let mut prefix = FRAME_MAGIC.to_vec();
        prefix.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());

        let err = FrameCodec::new().read_frame(&mut prefix.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_empty_content() {
        let mut prefix = FRAME_MAGIC.to_vec();
        prefix.extend_from_slice(&0u32.to_be_bytes());

        let err = FrameCodec::new().read_frame(&mut prefix.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_connection_closed() {
        let encoded = raw_frame(0, b"truncated");
        for cut in [3, PREFIX_SIZE + 2] {
            let err = FrameCodec::new()
                .read_frame(&mut &encoded[..cut])
                .await
                .unwrap_err();
            assert!(matches!(err, ProtocolError::ConnectionClosed(_)), "cut at {cut}: {err}");
            assert!(err.is_transport());
        }
    }

    #[tokio::test]
    async fn test_corrupt_compressed_body_is_invalid() {
        let encoded = raw_frame(FrameFlags::COMPRESSED, &[9, 0, 0, 0, 0xFF, 0xFF, 0xFF]);
        let err = FrameCodec::new().read_frame(&mut encoded.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("decompress"), "{err}");
    }

    #[tokio::test]
    async fn test_compression_bomb_announcement_is_refused() {
        let mut body = u32::MAX.to_le_bytes().to_vec();
        body.push(0);
        let encoded = raw_frame(FrameFlags::COMPRESSED, &body);
        let err = FrameCodec::new().read_frame(&mut encoded.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }
}
