//! Session orchestration: configuration, the three surface modes, and the
//! on-disk container.
//!
//! A session owns all mutable state (template bank, MTF list); nothing is
//! shared across sessions. Packet emission order is input order and the
//! decoder consumes packets strictly in that order.

use crate::error::{CodecError, Result};
use crate::frame::{entropy_compress, entropy_decompress, frame_packets, unframe_packets};
use crate::index::EventIndex;
use crate::miner::Miner;
use crate::mtf::MtfList;
use crate::packet::{encode_data, encode_dict, parse_data, parse_dict, render_row, SessionTables};
use tracing::debug;

pub const CONTAINER_MAGIC: &[u8; 4] = b"USC\0";
pub const CONTAINER_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// DICT + DATA, no outer pass; live appending.
    Stream,
    /// Stream body plus an event-id index packet; queryable and lossless.
    HotLiteFull,
    /// Maximum-ratio archive: outer entropy pass with a trained dictionary.
    Cold,
}

impl Mode {
    pub fn tag(self) -> u8 {
        match self {
            Mode::Stream => 1,
            Mode::HotLiteFull => 2,
            Mode::Cold => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Mode::Stream),
            2 => Some(Mode::HotLiteFull),
            3 => Some(Mode::Cold),
            _ => None,
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "stream" => Ok(Mode::Stream),
            "hot-lite-full" => Ok(Mode::HotLiteFull),
            "cold" => Ok(Mode::Cold),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CodecConfig {
    /// Lines per DATA packet.
    pub window_size: u32,
    pub mode: Mode,
    pub max_templates: u32,
    /// Observations before a slot locks its type.
    pub slot_promote_threshold: u32,
    pub canonicalize: bool,
    /// Cold mode trains an outer dictionary unless this is `Some(false)`;
    /// `None` is auto.
    pub outer_entropy: Option<bool>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            window_size: 25,
            mode: Mode::Stream,
            max_templates: 65_535,
            slot_promote_threshold: 8,
            canonicalize: true,
            outer_entropy: None,
        }
    }
}

impl CodecConfig {
    pub fn for_mode(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Applies `USC_WINDOW` and `USC_MAX_TEMPLATES` overrides.
    pub fn apply_env(mut self) -> Self {
        if let Some(w) = env_u32("USC_WINDOW") {
            self.window_size = w;
        }
        if let Some(m) = env_u32("USC_MAX_TEMPLATES") {
            self.max_templates = m;
        }
        self
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct EncodeStats {
    pub lines: usize,
    pub templated_rows: usize,
    pub raw_rows: usize,
    pub templates: usize,
    pub dict_bytes: usize,
    pub data_bytes: Vec<usize>,
    pub container_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct Encoded {
    /// DICT, DATA packets in window order, then the index packet in
    /// hot-lite-full mode.
    pub packets: Vec<Vec<u8>>,
    pub container: Vec<u8>,
    pub stats: EncodeStats,
}

/// Encodes a finite list of lines (each carrying its own terminator, when
/// present) into a container.
pub fn encode_lines(lines: &[Vec<u8>], cfg: &CodecConfig) -> Result<Encoded> {
    let mut miner = Miner::new(
        cfg.max_templates,
        cfg.slot_promote_threshold,
        cfg.canonicalize,
    );
    for line in lines {
        miner.push_line(line);
    }
    let mined = miner.finish();
    let tables = SessionTables::from_mined(&mined);

    let mut stats = EncodeStats {
        lines: lines.len(),
        templated_rows: mined.mask.popcount(),
        raw_rows: mined.mask.len() - mined.mask.popcount(),
        templates: tables.bank.len(),
        ..EncodeStats::default()
    };

    let dict = encode_dict(&tables);
    stats.dict_bytes = dict.len();

    let window = cfg.window_size.max(1) as usize;
    let mut packets = vec![dict];
    let mut window_sizes = Vec::new();
    let mut mtf = MtfList::new(tables.bank.len());
    for chunk in mined.rows.chunks(window) {
        let data = encode_data(&tables, chunk, &mut mtf);
        debug!(rows = chunk.len(), bytes = data.len(), "window encoded");
        stats.data_bytes.push(data.len());
        window_sizes.push(chunk.len());
        packets.push(data);
    }
    if cfg.mode == Mode::HotLiteFull {
        packets.push(EventIndex::from_window_sizes(window_sizes).encode());
    }

    let framed = frame_packets(&packets);
    let mut container = Vec::with_capacity(framed.len() / 2 + 16);
    container.extend_from_slice(CONTAINER_MAGIC);
    container.push(CONTAINER_VERSION);
    container.push(cfg.mode.tag());
    container.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    match cfg.mode {
        Mode::Stream | Mode::HotLiteFull => container.extend_from_slice(&framed),
        Mode::Cold => {
            let train = cfg.outer_entropy.unwrap_or(true);
            container.extend_from_slice(&entropy_compress(&framed, train)?);
        }
    }
    stats.container_bytes = container.len();

    Ok(Encoded {
        packets,
        container,
        stats,
    })
}

/// Fully decoded container: the lines plus the index when one was present.
#[derive(Clone, Debug)]
pub struct DecodedContainer {
    pub lines: Vec<Vec<u8>>,
    pub index: Option<EventIndex>,
    pub mode: Mode,
}

pub fn decode_container(bytes: &[u8]) -> Result<DecodedContainer> {
    if bytes.len() < 10 {
        return Err(CodecError::malformed(0, 0, "container header eof"));
    }
    if &bytes[..4] != CONTAINER_MAGIC {
        return Err(CodecError::malformed(0, 0, "bad container magic"));
    }
    if bytes[4] != CONTAINER_VERSION {
        return Err(CodecError::VersionUnsupported(bytes[4]));
    }
    let mode = Mode::from_tag(bytes[5]).ok_or(CodecError::ModeUnsupported(bytes[5]))?;
    let packet_count = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let body = &bytes[10..];

    let framed = match mode {
        Mode::Stream | Mode::HotLiteFull => body.to_vec(),
        Mode::Cold => entropy_decompress(body)?,
    };
    let packets = unframe_packets(&framed, packet_count)?;
    if packets.is_empty() {
        return Err(CodecError::malformed(10, 0, "container without dict packet"));
    }

    let tables = parse_dict(&packets[0])?;
    let (data_packets, index) = match mode {
        Mode::HotLiteFull => {
            if packets.len() < 2 {
                return Err(CodecError::malformed(10, 0, "missing index packet"));
            }
            let (last, rest) = packets.split_last().expect("len checked above");
            (&rest[1..], Some(EventIndex::parse(last)?))
        }
        _ => (&packets[1..], None),
    };

    let mut mtf = MtfList::new(tables.bank.len());
    let mut lines = Vec::new();
    for (i, packet) in data_packets.iter().enumerate() {
        let rows = parse_data(packet, &tables, &mut mtf, i + 1)?;
        for row in &rows {
            lines.push(render_row(&tables.bank, row));
        }
    }

    if let Some(idx) = &index {
        if idx.total_rows() != lines.len() as u64 {
            return Err(CodecError::malformed(0, packet_count, "index row count mismatch"));
        }
    }

    Ok(DecodedContainer { lines, index, mode })
}

/// Convenience for the verification harness and CLI.
pub fn decode_lines(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    Ok(decode_container(bytes)?.lines)
}

/// Splits a byte stream into terminator-inclusive lines.
pub fn split_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            lines.push(bytes[start..=i].to_vec());
            start = i + 1;
        }
    }
    if start < bytes.len() {
        lines.push(bytes[start..].to_vec());
    }
    lines
}

/// Inverse of [`split_lines`]: plain concatenation.
pub fn join_lines(lines: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(lines.iter().map(Vec::len).sum());
    for line in lines {
        out.extend_from_slice(line);
    }
    out
}
