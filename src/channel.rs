//! Typed per-slot channel codecs: INT delta, IP octet delta, HEX bit-pack,
//! DICT indices, RAW length-prefixed bytes.
//!
//! Every channel opens with a flags byte; bit 0 set means the typed encoding
//! was abandoned for this window and the payload is RAW. A typed payload
//! that would exceed its RAW equivalent also falls back, so a channel is
//! never worse than storing the plain values.

use crate::bits::{BitReader, BitWriter};
use crate::error::{CodecError, Result};
use crate::template::SlotType;
use crate::varint::{put_uvarint, unzigzag, uvarint, uvarint_len, zigzag};
use hashbrown::HashMap;
use tracing::warn;

pub const FLAG_FALLBACK: u8 = 0x01;

/// Strict decimal parse. Leading zeros are allowed (the window header
/// records the render width); values beyond `u64` are not INT material.
pub fn int_compat(v: &[u8]) -> Option<u64> {
    if v.is_empty() || v.len() > 20 || !v.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in v {
        acc = acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(acc)
}

/// Strict dotted quad: four octets 0..=255, no leading zeros.
pub fn ip_compat(v: &[u8]) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = v.split(|&b| b == b'.');
    for slot in &mut octets {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.iter().all(u8::is_ascii_digit) {
            return None;
        }
        if part.len() > 1 && part[0] == b'0' {
            return None;
        }
        let n: u32 = part
            .iter()
            .fold(0u32, |acc, &b| acc * 10 + u32::from(b - b'0'));
        if n > 255 {
            return None;
        }
        *slot = n as u8;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HexShape {
    pub value: u64,
    pub chars: usize,
    pub upper: bool,
}

/// Hex run of 1..=16 chars with uniform letter case.
pub fn hex_compat(v: &[u8]) -> Option<HexShape> {
    if v.is_empty() || v.len() > 16 || !v.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let has_upper = v.iter().any(|b| (b'A'..=b'F').contains(b));
    let has_lower = v.iter().any(|b| (b'a'..=b'f').contains(b));
    if has_upper && has_lower {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in v {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => unreachable!(),
        };
        acc = (acc << 4) | u64::from(d);
    }
    Some(HexShape {
        value: acc,
        chars: v.len(),
        upper: has_upper,
    })
}

pub fn render_int(value: u64, width: u8) -> Vec<u8> {
    if width == 0 {
        value.to_string().into_bytes()
    } else {
        format!("{value:0w$}", w = width as usize).into_bytes()
    }
}

pub fn render_ip(octets: [u8; 4]) -> Vec<u8> {
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]).into_bytes()
}

pub fn render_hex(value: u64, chars: usize, upper: bool) -> Vec<u8> {
    if upper {
        format!("{value:0w$X}", w = chars).into_bytes()
    } else {
        format!("{value:0w$x}", w = chars).into_bytes()
    }
}

/// Interned value table for a DICT slot: insertion-ordered values plus a
/// reverse map, mirrored on the decoder from the DICT packet.
#[derive(Clone, Debug, Default)]
pub struct ValueDict {
    by_value: HashMap<Vec<u8>, u32>,
    values: Vec<Vec<u8>>,
}

impl ValueDict {
    pub fn from_values(values: Vec<Vec<u8>>) -> Self {
        let mut by_value = HashMap::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            by_value.entry(v.clone()).or_insert(i as u32);
        }
        Self { by_value, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, v: &[u8]) -> Option<u32> {
        self.by_value.get(v).copied()
    }

    pub fn value(&self, idx: u32) -> Option<&[u8]> {
        self.values.get(idx as usize).map(Vec::as_slice)
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// Index footprint per occurrence: one byte up to 256 entries, two up
    /// to 65 536.
    pub fn idx_bytes(&self) -> usize {
        if self.values.len() <= 256 {
            1
        } else {
            2
        }
    }
}

fn raw_payload(values: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        put_uvarint(&mut out, v.len() as u64);
        out.extend_from_slice(v);
    }
    out
}

fn try_int(values: &[Vec<u8>]) -> Option<(u8, Vec<u8>)> {
    let mut parsed = Vec::with_capacity(values.len());
    for v in values {
        parsed.push(int_compat(v)?);
    }
    let natural = values.iter().all(|v| v.len() == 1 || v[0] != b'0');
    let width = if natural {
        0u8
    } else {
        let w = values[0].len();
        if w > 255 || values.iter().any(|v| v.len() != w) {
            return None;
        }
        w as u8
    };
    let mut payload = Vec::new();
    put_uvarint(&mut payload, parsed[0]);
    let mut prev = parsed[0];
    for &v in &parsed[1..] {
        put_uvarint(&mut payload, zigzag(v.wrapping_sub(prev) as i64));
        prev = v;
    }
    Some((width, payload))
}

fn try_ip(values: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut parsed = Vec::with_capacity(values.len());
    for v in values {
        parsed.push(ip_compat(v)?);
    }
    let mut payload = Vec::new();
    payload.extend_from_slice(&parsed[0]);
    let mut prev = parsed[0];
    for &cur in &parsed[1..] {
        for o in 0..4 {
            put_uvarint(
                &mut payload,
                zigzag(i64::from(cur[o]) - i64::from(prev[o])),
            );
        }
        prev = cur;
    }
    Some(payload)
}

fn try_hex(values: &[Vec<u8>]) -> Option<(u8, u8, u8, Vec<u8>)> {
    let mut parsed = Vec::with_capacity(values.len());
    for v in values {
        parsed.push(hex_compat(v)?);
    }
    let chars = parsed[0].chars;
    if parsed.iter().any(|s| s.chars != chars) {
        return None;
    }
    // Digits-only values are case-neutral; any cased value decides.
    let upper = parsed.iter().any(|s| s.upper);
    if upper
        && values
            .iter()
            .any(|v| v.iter().any(|b| (b'a'..=b'f').contains(b)))
    {
        return None;
    }
    let bit_width = parsed
        .iter()
        .map(|s| 64 - s.value.leading_zeros())
        .max()
        .unwrap_or(1)
        .max(1);
    let mut w = BitWriter::new();
    for s in &parsed {
        w.push(s.value, bit_width);
    }
    Some((chars as u8, u8::from(upper), bit_width as u8, w.finish()))
}

fn try_dict(values: &[Vec<u8>], dict: &ValueDict) -> Option<Vec<u8>> {
    let idx_bytes = dict.idx_bytes();
    let mut payload = Vec::with_capacity(values.len() * idx_bytes);
    for v in values {
        let idx = dict.index_of(v)?;
        if idx_bytes == 1 {
            payload.push(idx as u8);
        } else {
            payload.extend_from_slice(&(idx as u16).to_le_bytes());
        }
    }
    Some(payload)
}

/// Encodes one window's values for a slot. `dict` is present exactly for
/// DICT-typed slots.
pub fn encode_channel(
    out: &mut Vec<u8>,
    ty: SlotType,
    dict: Option<&ValueDict>,
    values: &[Vec<u8>],
) {
    debug_assert!(!values.is_empty());
    let raw = raw_payload(values);

    let typed: Option<(Vec<u8>, Vec<u8>)> = match ty {
        SlotType::Int => try_int(values).map(|(width, payload)| (vec![width], payload)),
        SlotType::Ip => try_ip(values).map(|payload| (Vec::new(), payload)),
        SlotType::Hex => try_hex(values)
            .map(|(chars, upper, bits, payload)| (vec![chars, upper, bits], payload)),
        SlotType::Dict => dict
            .and_then(|d| try_dict(values, d))
            .map(|payload| (Vec::new(), payload)),
        SlotType::Raw => None,
    };

    match typed {
        Some((header, payload)) if header.len() + payload.len() <= raw.len() => {
            out.push(0);
            out.extend_from_slice(&header);
            put_uvarint(out, payload.len() as u64);
            out.extend_from_slice(&payload);
        }
        other => {
            if other.is_some() {
                warn!(?ty, count = values.len(), "typed channel larger than raw, falling back");
            } else if ty != SlotType::Raw {
                warn!(?ty, count = values.len(), "slot values contradict locked type, falling back");
            }
            out.push(FLAG_FALLBACK);
            put_uvarint(out, raw.len() as u64);
            out.extend_from_slice(&raw);
        }
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > buf.len() {
        return Err(CodecError::malformed(*pos, 0, "channel payload eof"));
    }
    let s = &buf[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn decode_raw(payload: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
    let mut pos = 0usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let len = uvarint_len(payload, &mut pos)?;
        values.push(take(payload, &mut pos, len)?.to_vec());
    }
    if pos != payload.len() {
        return Err(CodecError::malformed(pos, 0, "trailing bytes in raw channel"));
    }
    Ok(values)
}

/// Decodes one window's values for a slot; `count` comes from the decoded
/// MTF stream.
pub fn decode_channel(
    buf: &[u8],
    pos: &mut usize,
    ty: SlotType,
    dict: Option<&ValueDict>,
    count: usize,
) -> Result<Vec<Vec<u8>>> {
    let flags = take(buf, pos, 1)?[0];
    if flags & FLAG_FALLBACK != 0 {
        let len = uvarint_len(buf, pos)?;
        return decode_raw(take(buf, pos, len)?, count);
    }
    match ty {
        SlotType::Raw => {
            let len = uvarint_len(buf, pos)?;
            decode_raw(take(buf, pos, len)?, count)
        }
        SlotType::Int => {
            let width = take(buf, pos, 1)?[0];
            let len = uvarint_len(buf, pos)?;
            let payload = take(buf, pos, len)?;
            let mut p = 0usize;
            let mut values = Vec::with_capacity(count);
            let mut prev = uvarint(payload, &mut p)?;
            values.push(render_int(prev, width));
            for _ in 1..count {
                let d = unzigzag(uvarint(payload, &mut p)?);
                prev = prev.wrapping_add(d as u64);
                values.push(render_int(prev, width));
            }
            if p != payload.len() {
                return Err(CodecError::malformed(*pos, 0, "trailing bytes in int channel"));
            }
            Ok(values)
        }
        SlotType::Ip => {
            let len = uvarint_len(buf, pos)?;
            let payload = take(buf, pos, len)?;
            let mut p = 0usize;
            let first = take(payload, &mut p, 4)?;
            let mut prev = [first[0], first[1], first[2], first[3]];
            let mut values = Vec::with_capacity(count);
            values.push(render_ip(prev));
            for _ in 1..count {
                let mut cur = [0u8; 4];
                for o in 0..4 {
                    let d = unzigzag(uvarint(payload, &mut p)?);
                    let v = i64::from(prev[o]) + d;
                    if !(0..=255).contains(&v) {
                        return Err(CodecError::malformed(*pos, 0, "ip octet out of range"));
                    }
                    cur[o] = v as u8;
                }
                values.push(render_ip(cur));
                prev = cur;
            }
            if p != payload.len() {
                return Err(CodecError::malformed(*pos, 0, "trailing bytes in ip channel"));
            }
            Ok(values)
        }
        SlotType::Hex => {
            let header = take(buf, pos, 3)?;
            let (chars, upper, bits) = (header[0], header[1] != 0, header[2]);
            if chars == 0 || chars > 16 || bits == 0 || bits > 64 {
                return Err(CodecError::malformed(*pos, 0, "bad hex channel header"));
            }
            let len = uvarint_len(buf, pos)?;
            let payload = take(buf, pos, len)?;
            if payload.len() != (count * bits as usize + 7) / 8 {
                return Err(CodecError::malformed(*pos, 0, "hex channel length mismatch"));
            }
            let mut r = BitReader::new(payload);
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let v = r.pull(u32::from(bits))?;
                values.push(render_hex(v, chars as usize, upper));
            }
            Ok(values)
        }
        SlotType::Dict => {
            let dict = dict
                .ok_or_else(|| CodecError::malformed(*pos, 0, "dict channel without table"))?;
            let idx_bytes = dict.idx_bytes();
            let len = uvarint_len(buf, pos)?;
            let payload = take(buf, pos, len)?;
            if payload.len() != count * idx_bytes {
                return Err(CodecError::malformed(*pos, 0, "dict channel length mismatch"));
            }
            let mut values = Vec::with_capacity(count);
            for chunk in payload.chunks(idx_bytes) {
                let idx = if idx_bytes == 1 {
                    u32::from(chunk[0])
                } else {
                    u32::from(u16::from_le_bytes([chunk[0], chunk[1]]))
                };
                let v = dict
                    .value(idx)
                    .ok_or_else(|| CodecError::malformed(*pos, 0, "dict index out of range"))?;
                values.push(v.to_vec());
            }
            Ok(values)
        }
    }
}
