//! LZ4 block stream used by compressed internode connections.
//!
//! The stream is a sequence of blocks:
//!
//! ```text
//! [Method(1)] [CompressedLen(4)] [RawLen(4)] [Checksum(4)] [Data(CompressedLen)]
//! ```
//!
//! `Method` is [`METHOD_RAW`] when compression did not pay off and
//! [`METHOD_LZ4`] otherwise. The checksum is an xxHash32 of the raw bytes,
//! seeded with [`LZ4_HASH_SEED`] and masked to 28 bits, so both ends must agree
//! on the seed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use xxhash_rust::xxh32::xxh32;

use crate::config::LZ4_HASH_SEED;
use crate::error::{ProtocolError, Result};

/// Block stored uncompressed.
pub const METHOD_RAW: u8 = 0x10;
/// Block compressed with LZ4.
pub const METHOD_LZ4: u8 = 0x20;

/// Largest raw block an encoder emits and a decoder accepts.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

pub const BLOCK_HEADER_SIZE: usize = 1 + 4 + 4 + 4;

const CHECKSUM_MASK: u32 = 0x0FFF_FFFF;

/// Checksum written into every block header.
pub fn block_checksum(raw: &[u8]) -> u32 {
    xxh32(raw, LZ4_HASH_SEED) & CHECKSUM_MASK
}

/// Compress one raw block, falling back to [`METHOD_RAW`] when LZ4 does not
/// make it smaller.
pub fn encode_block(raw: &[u8], dst: &mut BytesMut) {
    let compressed = lz4_flex::block::compress(raw);
    let (method, data): (u8, &[u8]) = if compressed.len() < raw.len() {
        (METHOD_LZ4, &compressed)
    } else {
        (METHOD_RAW, raw)
    };

    dst.reserve(BLOCK_HEADER_SIZE + data.len());
    dst.put_u8(method);
    dst.put_i32(data.len() as i32);
    dst.put_i32(raw.len() as i32);
    dst.put_i32(block_checksum(raw) as i32);
    dst.extend_from_slice(data);
}

/// Tokio codec for the compressed block stream.
///
/// Decoding yields the raw bytes of one block; encoding splits its input into
/// blocks of at most [`MAX_BLOCK_SIZE`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4BlockCodec;

impl Decoder for Lz4BlockCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < BLOCK_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..BLOCK_HEADER_SIZE];
        let method = header.get_u8();
        let compressed_len = header.get_i32();
        let raw_len = header.get_i32();
        let expected = header.get_i32() as u32;

        if method != METHOD_RAW && method != METHOD_LZ4 {
            return Err(ProtocolError::Decode(format!(
                "Unknown block method: 0x{method:02x}"
            )));
        }
        if compressed_len < 0 || compressed_len as usize > MAX_BLOCK_SIZE.max(lz4_bound()) {
            return Err(ProtocolError::MalformedLength(compressed_len as i64));
        }
        if raw_len < 0 || raw_len as usize > MAX_BLOCK_SIZE {
            return Err(ProtocolError::MalformedLength(raw_len as i64));
        }
        let compressed_len = compressed_len as usize;
        let raw_len = raw_len as usize;
        if method == METHOD_RAW && compressed_len != raw_len {
            return Err(ProtocolError::MalformedLength(compressed_len as i64));
        }

        let total = BLOCK_HEADER_SIZE + compressed_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(BLOCK_HEADER_SIZE);
        let data = src.split_to(compressed_len);

        let raw = if method == METHOD_LZ4 {
            let out = lz4_flex::block::decompress(&data, raw_len)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            if out.len() != raw_len {
                return Err(ProtocolError::DecompressionFailure);
            }
            Bytes::from(out)
        } else {
            data.freeze()
        };

        let actual = block_checksum(&raw);
        if actual != expected {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }
        Ok(Some(raw))
    }
}

impl Encoder<Bytes> for Lz4BlockCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        for chunk in item.chunks(MAX_BLOCK_SIZE) {
            encode_block(chunk, dst);
        }
        Ok(())
    }
}

// Worst-case LZ4 output for an incompressible MAX_BLOCK_SIZE input.
fn lz4_bound() -> usize {
    lz4_flex::block::get_maximum_output_size(MAX_BLOCK_SIZE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encode(data: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        Lz4BlockCodec
            .encode(Bytes::copy_from_slice(data), &mut dst)
            .unwrap();
        dst
    }

    fn decode_all(mut src: BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(block) = Lz4BlockCodec.decode(&mut src).unwrap() {
            out.extend_from_slice(&block);
        }
        assert!(src.is_empty());
        out
    }

    #[test]
    fn test_compressible_block_uses_lz4() {
        let data = vec![7u8; 4096];
        let encoded = encode(&data);
        assert_eq!(encoded[0], METHOD_LZ4);
        assert!(encoded.len() < data.len());
        assert_eq!(decode_all(encoded), data);
    }

    #[test]
    fn test_incompressible_block_stored_raw() {
        let data = b"abc".to_vec();
        let encoded = encode(&data);
        assert_eq!(encoded[0], METHOD_RAW);
        assert_eq!(decode_all(encoded), data);
    }

    #[test]
    fn test_large_input_is_split_into_blocks() {
        let data: Vec<u8> = (0..MAX_BLOCK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&data);
        assert_eq!(decode_all(encoded), data);
    }

    #[test]
    fn test_partial_block_waits() {
        let encoded = encode(&[1u8; 1000]);
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Lz4BlockCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut encoded = encode(b"hello world");
        // flip a bit of the stored checksum
        encoded[12] ^= 0x01;
        assert!(matches!(
            Lz4BlockCodec.decode(&mut encoded),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_uses_28_bits() {
        assert_eq!(block_checksum(b"anything") & !CHECKSUM_MASK, 0);
    }

    #[test]
    fn test_oversized_raw_length_rejected() {
        let mut src = BytesMut::new();
        src.put_u8(METHOD_LZ4);
        src.put_i32(16);
        src.put_i32((MAX_BLOCK_SIZE + 1) as i32);
        src.put_i32(0);
        assert!(matches!(
            Lz4BlockCodec.decode(&mut src),
            Err(ProtocolError::MalformedLength(_))
        ));
    }

    #[test]
    fn test_malformed_lz4_data() {
        let mut src = BytesMut::new();
        src.put_u8(METHOD_LZ4);
        src.put_i32(4);
        src.put_i32(1024);
        src.put_i32(0);
        src.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(Lz4BlockCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut src = BytesMut::new();
        src.put_u8(0x30);
        src.put_i32(0);
        src.put_i32(0);
        src.put_i32(0);
        assert!(matches!(
            Lz4BlockCodec.decode(&mut src),
            Err(ProtocolError::Decode(_))
        ));
    }
}
