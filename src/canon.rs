//! Lossless canonicalizer: volatile tokens -> sentinels + side entries.
//!
//! Recognition runs left-to-right on non-alphanumeric boundaries, longest
//! match first. Matched spans are replaced by a sentinel and the original
//! bytes are side-carried so `uncanonicalize` restores the line exactly.

use crate::error::{CodecError, Result};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SideKind {
    Ts = 0,
    Uuid = 1,
    Hex = 2,
    Int = 3,
}

impl SideKind {
    pub fn sentinel(self) -> &'static [u8] {
        match self {
            SideKind::Ts => b"<TS>",
            SideKind::Uuid => b"<UUID>",
            SideKind::Hex => b"<HEX>",
            SideKind::Int => b"<INT>",
        }
    }
}

pub const SENTINELS: [SideKind; 4] = [SideKind::Ts, SideKind::Uuid, SideKind::Hex, SideKind::Int];

/// One stripped original, in line order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideEntry {
    pub kind: SideKind,
    pub bytes: Vec<u8>,
}

#[inline]
fn is_alnum(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

#[inline]
fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn digit_run(line: &[u8], at: usize) -> usize {
    line[at..].iter().take_while(|b| b.is_ascii_digit()).count()
}

fn hex_run(line: &[u8], at: usize) -> usize {
    line[at..].iter().take_while(|&&b| is_hex(b)).count()
}

/// True when the span ending at `end` sits on a non-alphanumeric boundary.
fn ends_clean(line: &[u8], end: usize) -> bool {
    end >= line.len() || !is_alnum(line[end])
}

fn match_fixed_digits(line: &[u8], at: usize, n: usize) -> bool {
    line.len() >= at + n && line[at..at + n].iter().all(|b| b.is_ascii_digit())
}

/// `YYYY-MM-DD[ T]HH:MM:SS(.f{1,9})?(Z|+HH:MM|-HH:MM)?`
fn match_ts_structured(line: &[u8], at: usize) -> Option<usize> {
    let mut i = at;
    if !match_fixed_digits(line, i, 4) {
        return None;
    }
    i += 4;
    for _ in 0..2 {
        if line.get(i) != Some(&b'-') || !match_fixed_digits(line, i + 1, 2) {
            return None;
        }
        i += 3;
    }
    match line.get(i) {
        Some(&b' ') | Some(&b'T') => i += 1,
        _ => return None,
    }
    if !match_fixed_digits(line, i, 2) {
        return None;
    }
    i += 2;
    for _ in 0..2 {
        if line.get(i) != Some(&b':') || !match_fixed_digits(line, i + 1, 2) {
            return None;
        }
        i += 3;
    }
    if line.get(i) == Some(&b'.') {
        let frac = digit_run(line, i + 1);
        if (1..=9).contains(&frac) {
            i += 1 + frac;
        } else {
            return None;
        }
    }
    match line.get(i) {
        Some(&b'Z') => i += 1,
        Some(&b'+') | Some(&b'-')
            if match_fixed_digits(line, i + 1, 2)
                && line.get(i + 3) == Some(&b':')
                && match_fixed_digits(line, i + 4, 2) =>
        {
            i += 6;
        }
        _ => {}
    }
    if ends_clean(line, i) {
        Some(i - at)
    } else {
        None
    }
}

/// Epoch seconds: a decimal run of >= 10 digits on a clean end boundary.
fn match_ts_epoch(line: &[u8], at: usize) -> Option<usize> {
    let run = digit_run(line, at);
    if run >= 10 && ends_clean(line, at + run) {
        Some(run)
    } else {
        None
    }
}

fn match_ts(line: &[u8], at: usize) -> Option<usize> {
    match (match_ts_structured(line, at), match_ts_epoch(line, at)) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn match_uuid(line: &[u8], at: usize) -> Option<usize> {
    let groups = [8usize, 4, 4, 4, 12];
    let mut i = at;
    for (g, &n) in groups.iter().enumerate() {
        if g > 0 {
            if line.get(i) != Some(&b'-') {
                return None;
            }
            i += 1;
        }
        if line.len() < i + n || !line[i..i + n].iter().all(|&b| is_hex(b)) {
            return None;
        }
        // Reject over-long groups ("deadbeef0-...").
        if is_hex(*line.get(i + n).unwrap_or(&b'-')) {
            return None;
        }
        i += n;
    }
    if ends_clean(line, i) {
        Some(i - at)
    } else {
        None
    }
}

/// Hex runs of length >= 8 with at least one letter. A pure decimal run is a
/// decimal run, never HEX.
fn match_hex(line: &[u8], at: usize) -> Option<usize> {
    let run = hex_run(line, at);
    if run >= 8
        && ends_clean(line, at + run)
        && line[at..at + run].iter().any(|b| b.is_ascii_alphabetic())
    {
        Some(run)
    } else {
        None
    }
}

/// Decimal runs of 6..=9 digits. Runs of >= 10 are TS-epoch.
fn match_int(line: &[u8], at: usize) -> Option<usize> {
    let run = digit_run(line, at);
    if (6..=9).contains(&run) && ends_clean(line, at + run) {
        Some(run)
    } else {
        None
    }
}

/// A literal sentinel in the input is replaced by itself and side-carried,
/// keeping `uncanonicalize` exact on arbitrary bytes.
fn match_literal_sentinel(line: &[u8], at: usize) -> Option<(SideKind, usize)> {
    for kind in SENTINELS {
        let s = kind.sentinel();
        if line[at..].starts_with(s) {
            return Some((kind, s.len()));
        }
    }
    None
}

fn match_volatile(line: &[u8], at: usize) -> Option<(SideKind, usize)> {
    let candidates = [
        (SideKind::Ts, match_ts(line, at)),
        (SideKind::Uuid, match_uuid(line, at)),
        (SideKind::Hex, match_hex(line, at)),
        (SideKind::Int, match_int(line, at)),
    ];
    let mut best: Option<(SideKind, usize)> = None;
    for (kind, m) in candidates {
        if let Some(len) = m {
            if best.map_or(true, |(_, b)| len > b) {
                best = Some((kind, len));
            }
        }
    }
    best
}

/// Replaces volatile tokens with sentinels. Pure; cannot fail.
pub fn canonicalize(line: &[u8]) -> (Vec<u8>, Vec<SideEntry>) {
    let mut out = Vec::with_capacity(line.len());
    let mut side = Vec::new();
    let mut i = 0usize;
    while i < line.len() {
        if let Some((kind, len)) = match_literal_sentinel(line, i) {
            out.extend_from_slice(kind.sentinel());
            side.push(SideEntry {
                kind,
                bytes: line[i..i + len].to_vec(),
            });
            i += len;
            continue;
        }
        let boundary = i == 0 || !is_alnum(line[i - 1]);
        if boundary {
            if let Some((kind, len)) = match_volatile(line, i) {
                out.extend_from_slice(kind.sentinel());
                side.push(SideEntry {
                    kind,
                    bytes: line[i..i + len].to_vec(),
                });
                i += len;
                continue;
            }
        }
        out.push(line[i]);
        i += 1;
    }
    (out, side)
}

/// Exact inverse of [`canonicalize`].
pub fn uncanonicalize(canonical: &[u8], side: &[SideEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(canonical.len());
    let mut next = 0usize;
    let mut i = 0usize;
    while i < canonical.len() {
        let mut hit = false;
        for kind in SENTINELS {
            let s = kind.sentinel();
            if canonical[i..].starts_with(s) {
                let entry = side
                    .get(next)
                    .ok_or_else(|| CodecError::malformed(i, 0, "side vector underrun"))?;
                if entry.kind != kind {
                    return Err(CodecError::malformed(i, 0, "side vector kind mismatch"));
                }
                out.extend_from_slice(&entry.bytes);
                next += 1;
                i += s.len();
                hit = true;
                break;
            }
        }
        if !hit {
            out.push(canonical[i]);
            i += 1;
        }
    }
    if next != side.len() {
        return Err(CodecError::malformed(i, 0, "side vector overrun"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(line: &[u8]) -> (Vec<u8>, Vec<SideEntry>) {
        let (canonical, side) = canonicalize(line);
        assert_eq!(uncanonicalize(&canonical, &side).unwrap(), line);
        (canonical, side)
    }

    #[test]
    fn timestamp_uuid_and_int_in_one_line() {
        let line = b"2024-01-01 00:00:00 uid=550e8400-e29b-41d4-a716-446655440000 v=1234567";
        let (canonical, side) = roundtrip(line);
        assert_eq!(canonical, b"<TS> uid=<UUID> v=<INT>".to_vec());
        assert_eq!(
            side.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![SideKind::Ts, SideKind::Uuid, SideKind::Int]
        );
        assert_eq!(side[2].bytes, b"1234567");
    }

    #[test]
    fn epoch_is_ts() {
        let (canonical, side) = roundtrip(b"at 1700000000 ok");
        assert_eq!(canonical, b"at <TS> ok".to_vec());
        assert_eq!(side[0].kind, SideKind::Ts);
    }

    #[test]
    fn iso_with_fraction_and_zone() {
        let (canonical, _) = roundtrip(b"2024-06-30T23:59:59.123+02:00 done");
        assert_eq!(canonical, b"<TS> done".to_vec());
    }

    #[test]
    fn hex_needs_a_letter() {
        // 8 digits: INT territory, not HEX.
        let (canonical, side) = roundtrip(b"id 12345678");
        assert_eq!(canonical, b"id <INT>".to_vec());
        assert_eq!(side[0].kind, SideKind::Int);

        let (canonical, side) = roundtrip(b"id deadbeef01");
        assert_eq!(canonical, b"id <HEX>".to_vec());
        assert_eq!(side[0].kind, SideKind::Hex);
    }

    #[test]
    fn mid_word_boundary_blocks_numeric_match() {
        // "xyz1234567" has no non-alphanumeric boundary before the digits.
        let (canonical, side) = roundtrip(b"xyz1234567 x");
        assert_eq!(canonical, b"xyz1234567 x".to_vec());
        assert!(side.is_empty());
    }

    #[test]
    fn underscore_is_a_boundary() {
        let (canonical, side) = roundtrip(b"blk_-1608999687919862906");
        assert_eq!(canonical, b"blk_-<TS>".to_vec());
        assert_eq!(side[0].bytes, b"1608999687919862906");
    }

    #[test]
    fn literal_sentinel_self_escapes() {
        let line = b"weird <TS> literal and x<INT>y";
        let (canonical, side) = roundtrip(line);
        assert_eq!(canonical, line.to_vec());
        assert_eq!(side.len(), 2);
    }

    #[test]
    fn invalid_utf8_passes_through() {
        let line = [0xff, 0xfe, b' ', b'1', b'2', b'3', b'4', b'5', b'6', 0x80];
        let (canonical, side) = canonicalize(&line);
        assert_eq!(uncanonicalize(&canonical, &side).unwrap(), line);
    }

    #[test]
    fn side_mismatch_rejected() {
        let (canonical, mut side) = canonicalize(b"t 1234567");
        side.clear();
        assert!(uncanonicalize(&canonical, &side).is_err());
    }
}
