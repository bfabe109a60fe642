//! Outer framing and the cold-mode entropy pass.
//!
//! The framed stream is the varint-length-prefixed concatenation of the
//! DICT packet and every DATA packet in emission order. Cold mode runs the
//! whole framed stream through zstd, optionally with a dictionary trained
//! on the leading sample region; the dictionary travels in front of the
//! compressed block behind a tag byte, and a decoder that sees the tag must
//! use it.

use crate::error::{CodecError, Result};
use crate::varint::{put_uvarint, uvarint_len};
use tracing::debug;

/// Sample region for dictionary training: the first 112 KiB of framed bytes.
pub const DICT_SAMPLE_BYTES: usize = 112 * 1024;
/// Below this the stream is too small for training to pay for the dictionary.
const TRAIN_FLOOR_BYTES: usize = 16 * 1024;
const TRAIN_CHUNK_BYTES: usize = 512;
const MAX_DICT_BYTES: usize = 16 * 1024;
const ZSTD_LEVEL: i32 = 19;

const TAG_PLAIN: u8 = 0;
const TAG_TRAINED_DICT: u8 = 1;

pub fn frame_packets(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in packets {
        put_uvarint(&mut out, p.len() as u64);
        out.extend_from_slice(p);
    }
    out
}

pub fn unframe_packets(buf: &[u8], expected: usize) -> Result<Vec<Vec<u8>>> {
    let mut pos = 0usize;
    let mut packets = Vec::with_capacity(expected);
    for _ in 0..expected {
        let len = uvarint_len(buf, &mut pos)?;
        if pos + len > buf.len() {
            return Err(CodecError::malformed(pos, packets.len(), "framed packet eof"));
        }
        packets.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    if pos != buf.len() {
        return Err(CodecError::malformed(pos, expected, "trailing bytes after packets"));
    }
    Ok(packets)
}

fn train_dictionary(framed: &[u8]) -> Option<Vec<u8>> {
    if framed.len() < TRAIN_FLOOR_BYTES {
        return None;
    }
    let region = &framed[..framed.len().min(DICT_SAMPLE_BYTES)];
    let mut sizes = vec![TRAIN_CHUNK_BYTES; region.len() / TRAIN_CHUNK_BYTES];
    let tail = region.len() % TRAIN_CHUNK_BYTES;
    if tail > 0 {
        sizes.push(tail);
    }
    match zstd::dict::from_continuous(region, &sizes, MAX_DICT_BYTES) {
        Ok(dict) if !dict.is_empty() => Some(dict),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "dictionary training failed, compressing without one");
            None
        }
    }
}

/// Entropy-codes the framed stream. `train` enables the dictionary attempt;
/// training silently degrades to a plain pass when the stream is too small
/// or the trainer rejects the sample.
pub fn entropy_compress(framed: &[u8], train: bool) -> Result<Vec<u8>> {
    let dict = if train { train_dictionary(framed) } else { None };
    let mut out = Vec::new();
    let compressed = match &dict {
        Some(dict_bytes) => {
            out.push(TAG_TRAINED_DICT);
            put_uvarint(&mut out, dict_bytes.len() as u64);
            out.extend_from_slice(dict_bytes);
            let mut c = zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, dict_bytes)?;
            c.compress(framed)?
        }
        None => {
            out.push(TAG_PLAIN);
            let mut c = zstd::bulk::Compressor::new(ZSTD_LEVEL)?;
            c.compress(framed)?
        }
    };
    put_uvarint(&mut out, framed.len() as u64);
    out.extend_from_slice(&compressed);
    debug!(
        framed = framed.len(),
        compressed = compressed.len(),
        trained = dict.is_some(),
        "entropy pass complete"
    );
    Ok(out)
}

pub fn entropy_decompress(buf: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let tag = *buf
        .get(pos)
        .ok_or_else(|| CodecError::malformed(0, 0, "entropy tag eof"))?;
    pos += 1;

    let dict = match tag {
        TAG_PLAIN => None,
        TAG_TRAINED_DICT => {
            let len = uvarint_len(buf, &mut pos)?;
            if pos + len > buf.len() {
                return Err(CodecError::malformed(pos, 0, "entropy dictionary eof"));
            }
            let d = &buf[pos..pos + len];
            pos += len;
            Some(d)
        }
        _ => return Err(CodecError::malformed(0, 0, "unknown entropy tag")),
    };

    let framed_len = uvarint_len(buf, &mut pos)?;
    let body = &buf[pos..];
    let mut d = match dict {
        Some(dict_bytes) => zstd::bulk::Decompressor::with_dictionary(dict_bytes)
            .map_err(|_| CodecError::malformed(pos, 0, "bad entropy dictionary"))?,
        None => zstd::bulk::Decompressor::new()
            .map_err(|_| CodecError::malformed(pos, 0, "entropy init failed"))?,
    };
    let framed = d
        .decompress(body, framed_len)
        .map_err(|_| CodecError::malformed(pos, 0, "corrupt entropy stream"))?;
    if framed.len() != framed_len {
        return Err(CodecError::malformed(pos, 0, "entropy length mismatch"));
    }
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_unframe() {
        let packets = vec![b"USCD....".to_vec(), b"USCx".to_vec(), Vec::new()];
        let framed = frame_packets(&packets);
        assert_eq!(unframe_packets(&framed, 3).unwrap(), packets);
    }

    #[test]
    fn unframe_rejects_truncation() {
        let packets = vec![b"abcdef".to_vec()];
        let mut framed = frame_packets(&packets);
        framed.truncate(framed.len() - 2);
        assert!(unframe_packets(&framed, 1).is_err());
    }

    #[test]
    fn entropy_small_stream_plain_tag() {
        let framed = b"tiny framed stream".to_vec();
        let packed = entropy_compress(&framed, true).unwrap();
        assert_eq!(packed[0], TAG_PLAIN);
        assert_eq!(entropy_decompress(&packed).unwrap(), framed);
    }

    #[test]
    fn entropy_large_repetitive_stream() {
        let mut framed = Vec::new();
        for i in 0..4000 {
            framed.extend_from_slice(
                format!("block {i} state ok checksum {:08x}\n", i * 2654435761u64).as_bytes(),
            );
        }
        let packed = entropy_compress(&framed, true).unwrap();
        assert!(packed[0] == TAG_PLAIN || packed[0] == TAG_TRAINED_DICT);
        assert!(packed.len() < framed.len());
        assert_eq!(entropy_decompress(&packed).unwrap(), framed);
    }

    #[test]
    fn entropy_truncation_detected() {
        let framed = vec![7u8; 64 * 1024];
        let mut packed = entropy_compress(&framed, false).unwrap();
        packed.truncate(packed.len() - 4);
        assert!(entropy_decompress(&packed).is_err());
    }
}
