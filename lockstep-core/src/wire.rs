//! Framing: 13-byte header (kind, payload size, uncompressed size, frame number; LE) + payload.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{Header, MessageKind, HEADER_SIZE};

/// Encode a header into its fixed wire form.
pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0] = header.kind.as_u8();
    out[1..5].copy_from_slice(&header.payload_size.to_le_bytes());
    out[5..9].copy_from_slice(&header.uncompressed_size.to_le_bytes());
    out[9..13].copy_from_slice(&header.frame_number.to_le_bytes());
    out
}

/// Decode a header from its fixed wire form.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> Result<Header, HeaderError> {
    let payload_size = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let uncompressed_size = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    let frame_number = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    let kind = MessageKind::try_from(bytes[0]).map_err(|kind| HeaderError::UnknownKind {
        kind,
        payload_size,
    })?;
    Ok(Header {
        kind,
        payload_size,
        uncompressed_size,
        frame_number,
    })
}

/// Error decoding a header.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Payload size is still reported so the reader can skip the payload.
    #[error("unknown message kind {kind}")]
    UnknownKind { kind: u8, payload_size: u32 },
}

/// Encode one complete message: header followed by `payload`.
pub fn encode_message(kind: MessageKind, frame_number: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(kind, frame_number, payload.len() as u32);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&encode_header(&header));
    out.extend_from_slice(payload);
    out
}

/// Overwrite the reserved header space at the front of `block` (a shared data block).
/// The payload size is taken from the block length.
pub fn stamp_header(block: &mut [u8], kind: MessageKind, frame_number: u32) {
    debug_assert!(block.len() >= HEADER_SIZE);
    let header = Header::new(kind, frame_number, (block.len() - HEADER_SIZE) as u32);
    block[..HEADER_SIZE].copy_from_slice(&encode_header(&header));
}

/// Compressed data-transfer message. `uncompressed_size` carries the original length.
pub fn encode_compressed_message(
    package_id: u32,
    payload: &[u8],
    level: u32,
) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;
    let header = Header {
        kind: MessageKind::CompressedData,
        payload_size: compressed.len() as u32,
        uncompressed_size: payload.len() as u32,
        frame_number: package_id,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + compressed.len());
    out.extend_from_slice(&encode_header(&header));
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Inflate a `CompressedData` payload. Fails if the result is not `expected_len` bytes.
/// Never inflates more than one byte past `expected_len`.
pub fn inflate_payload(compressed: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve(expected_len)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::OutOfMemory, e.to_string()))?;
    ZlibDecoder::new(compressed)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("inflated {} bytes, header said {}", out.len(), expected_len),
        ));
    }
    Ok(out)
}

/// Read exactly one header from the stream. EOF surfaces as `UnexpectedEof`.
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<[u8; HEADER_SIZE]> {
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read exactly `len` payload bytes into `buf`, growing it when needed.
/// Returns the payload slice. Growth failure is reported as `OutOfMemory`.
pub async fn read_payload<'a, R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &'a mut Vec<u8>,
    len: usize,
) -> std::io::Result<&'a [u8]> {
    if len > buf.len() {
        buf.try_reserve(len - buf.len()).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::OutOfMemory, e.to_string())
        })?;
        buf.resize(len, 0);
    }
    reader.read_exact(&mut buf[..len]).await?;
    Ok(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_of(msg: &[u8]) -> Result<Header, HeaderError> {
        decode_header(msg[..HEADER_SIZE].try_into().unwrap())
    }

    #[test]
    fn message_is_header_plus_payload() {
        for n in [0usize, 1, 9, 1024, 5000] {
            let payload = vec![0xAB; n];
            let msg = encode_message(MessageKind::Data, 7, &payload);
            assert_eq!(msg.len(), HEADER_SIZE + n);
            let header = header_of(&msg).unwrap();
            assert_eq!(header.payload_size as usize, n);
            assert_eq!(header.frame_number, 7);
            assert_eq!(header.kind, MessageKind::Data);
            assert_eq!(&msg[HEADER_SIZE..], &payload[..]);
        }
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = Header {
            kind: MessageKind::Data,
            payload_size: 0x0102_0304,
            uncompressed_size: 0x0A0B_0C0D,
            frame_number: 5,
        };
        let bytes = encode_header(&header);
        assert_eq!(
            bytes,
            [17, 4, 3, 2, 1, 0x0D, 0x0C, 0x0B, 0x0A, 5, 0, 0, 0]
        );
    }

    #[test]
    fn unknown_kind_keeps_payload_size() {
        let mut msg = encode_message(MessageKind::Data, 1, &[1, 2, 3]);
        msg[0] = 99;
        assert_eq!(
            header_of(&msg),
            Err(HeaderError::UnknownKind {
                kind: 99,
                payload_size: 3
            })
        );
    }

    #[test]
    fn stamp_header_uses_block_length() {
        let mut block = vec![0u8; HEADER_SIZE];
        block.extend_from_slice(b"payload");
        stamp_header(&mut block, MessageKind::Data, 42);
        let header = header_of(&block).unwrap();
        assert_eq!(header.payload_size, 7);
        assert_eq!(header.frame_number, 42);
    }

    #[test]
    fn compressed_message_inflates() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let msg = encode_compressed_message(3, &payload, 6).unwrap();
        let header = header_of(&msg).unwrap();
        assert_eq!(header.kind, MessageKind::CompressedData);
        assert_eq!(header.uncompressed_size as usize, payload.len());
        assert_eq!(header.payload_size as usize, msg.len() - HEADER_SIZE);
        assert!(msg.len() < payload.len());
        let out = inflate_payload(&msg[HEADER_SIZE..], payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn inflate_rejects_size_mismatch() {
        let payload = vec![7u8; 4096];
        let msg = encode_compressed_message(1, &payload, 6).unwrap();
        let body = &msg[HEADER_SIZE..];
        let short = inflate_payload(body, 100).unwrap_err();
        assert_eq!(short.kind(), std::io::ErrorKind::InvalidData);
        assert!(inflate_payload(body, 5000).is_err());
    }

    #[test]
    fn inflate_stops_past_expected_length() {
        // A header claiming 16 bytes must not inflate the whole 1 MiB stream.
        let payload = vec![0u8; 1 << 20];
        let msg = encode_compressed_message(1, &payload, 9).unwrap();
        let err = inflate_payload(&msg[HEADER_SIZE..], 16).unwrap_err();
        assert!(err.to_string().contains("inflated 17 bytes"));
    }

    #[test]
    fn read_payload_grows_buffer() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
            let msg = encode_message(MessageKind::Data, 1, &payload);
            let mut reader = &msg[..];
            let mut buf = vec![0u8; 1024];
            let header = decode_header(&read_header(&mut reader).await.unwrap()).unwrap();
            let got = read_payload(&mut reader, &mut buf, header.payload_size as usize)
                .await
                .unwrap();
            assert_eq!(got, &payload[..]);
            assert_eq!(buf.len(), 5000);
        });
    }
}
