//! Benchmarking and roundtrip verification utilities.

use crate::codec::{decode_lines, encode_lines, CodecConfig};
use crate::error::{CodecError, Result};
use crate::tier::{CommitLog, Decoded};

#[derive(Clone, Debug, serde::Serialize)]
pub struct BenchResult {
    pub input_bytes: usize,
    pub lines: usize,
    pub templates: usize,
    pub templated_rows: usize,
    pub raw_rows: usize,
    pub dict_bytes: usize,
    pub data_bytes_total: usize,
    pub container_bytes: usize,
    pub seconds: f64,
    pub lines_per_sec: f64,
    pub compression_ratio: f64,
}

pub fn bench_encode(lines: &[Vec<u8>], cfg: &CodecConfig) -> Result<BenchResult> {
    let start = std::time::Instant::now();
    let encoded = encode_lines(lines, cfg)?;
    let secs = start.elapsed().as_secs_f64();

    let input_bytes: usize = lines.iter().map(Vec::len).sum();
    let stats = &encoded.stats;
    let data_bytes_total: usize = stats.data_bytes.iter().sum();
    let ratio = if stats.container_bytes > 0 {
        input_bytes as f64 / stats.container_bytes as f64
    } else {
        1.0
    };

    Ok(BenchResult {
        input_bytes,
        lines: stats.lines,
        templates: stats.templates,
        templated_rows: stats.templated_rows,
        raw_rows: stats.raw_rows,
        dict_bytes: stats.dict_bytes,
        data_bytes_total,
        container_bytes: stats.container_bytes,
        seconds: secs,
        lines_per_sec: (stats.lines as f64) / secs.max(1e-9),
        compression_ratio: ratio,
    })
}

/// Drives the full encode -> decode -> compare loop, committing each exact
/// line to the tier log. Any divergence is a [`CodecError::RoundtripMismatch`]
/// naming the first bad line.
pub fn verify_lossless(lines: &[Vec<u8>], cfg: &CodecConfig) -> Result<CommitLog> {
    let encoded = encode_lines(lines, cfg)?;
    let decoded = decode_lines(&encoded.container)?;
    if decoded.len() != lines.len() {
        return Err(CodecError::RoundtripMismatch {
            line: decoded.len().min(lines.len()),
        });
    }
    let mut log = CommitLog::new(1.0);
    for (i, (original, restored)) in lines.iter().zip(&decoded).enumerate() {
        if !log.commit(original, Decoded::Exact(restored.clone())) {
            return Err(CodecError::RoundtripMismatch { line: i });
        }
    }
    Ok(log)
}
