//! Streaming template miner: lines in, (template-id, parameter) rows out.
//!
//! Lines carry their own terminator, so a mined template reproduces the line
//! by pure concatenation of literal pieces and slot values.

use crate::canon;
use crate::channel::{hex_compat, int_compat, ip_compat};
use crate::template::{Piece, SlotType, TemplateBank, TemplateId};
use tracing::{debug, warn};

pub const DICT_CARDINALITY_CAP: usize = 65_536;

/// One ingested line after mining.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Row {
    Templated {
        tid: TemplateId,
        params: Vec<Vec<u8>>,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

/// Bitmap over rows: 1 = templated, 0 = raw. Preserves interleaving.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowMask {
    bits: Vec<bool>,
}

impl RowMask {
    pub fn push(&mut self, templated: bool) {
        self.bits.push(templated);
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn popcount(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    pub fn from_bools(bits: Vec<bool>) -> Self {
        Self { bits }
    }
}

/// Per-(template, slot) observation state driving type promotion.
#[derive(Clone, Debug)]
struct TypeTracker {
    seen: u32,
    all_int: bool,
    all_ip: bool,
    all_hex: bool,
    locked: Option<SlotType>,
    values: Vec<Vec<u8>>,
    value_set: hashbrown::HashSet<Vec<u8>>,
    overflowed: bool,
}

impl TypeTracker {
    fn new() -> Self {
        Self {
            seen: 0,
            all_int: true,
            all_ip: true,
            all_hex: true,
            locked: None,
            values: Vec::new(),
            value_set: hashbrown::HashSet::new(),
            overflowed: false,
        }
    }

    fn observe(&mut self, value: &[u8], promote_threshold: u32) {
        if self.locked.is_none() {
            self.all_int &= int_compat(value).is_some();
            self.all_ip &= ip_compat(value).is_some();
            self.all_hex &= hex_compat(value).is_some();
        }
        self.seen += 1;
        if self.locked.is_none() && self.seen >= promote_threshold {
            // Most specific consistent type wins; promotion is monotone.
            self.locked = if self.all_int {
                Some(SlotType::Int)
            } else if self.all_ip {
                Some(SlotType::Ip)
            } else if self.all_hex {
                Some(SlotType::Hex)
            } else {
                None
            };
            if self.locked.is_some() {
                self.values.clear();
                self.value_set.clear();
            }
        }
        if self.locked.is_none() && !self.overflowed {
            if !self.value_set.contains(value) {
                if self.value_set.len() >= DICT_CARDINALITY_CAP {
                    self.overflowed = true;
                    self.values.clear();
                    self.value_set.clear();
                } else {
                    self.value_set.insert(value.to_vec());
                    self.values.push(value.to_vec());
                }
            }
        }
    }

    fn finish(self) -> (SlotType, Option<Vec<Vec<u8>>>) {
        match self.locked {
            Some(t) => (t, None),
            None if !self.overflowed => (SlotType::Dict, Some(self.values)),
            None => (SlotType::Raw, None),
        }
    }
}

/// Everything the packet assembler needs once the bank is frozen.
#[derive(Clone, Debug)]
pub struct Mined {
    pub bank: TemplateBank,
    pub rows: Vec<Row>,
    pub mask: RowMask,
    /// Locked type per (template, slot).
    pub slot_types: Vec<Vec<SlotType>>,
    /// Insertion-ordered value dictionary per DICT slot, `None` otherwise.
    pub dicts: Vec<Vec<Option<Vec<Vec<u8>>>>>,
}

pub struct Miner {
    bank: TemplateBank,
    trackers: Vec<Vec<TypeTracker>>,
    rows: Vec<Row>,
    mask: RowMask,
    max_templates: u32,
    promote_threshold: u32,
    canonicalize: bool,
    overflow_reported: bool,
}

impl Miner {
    pub fn new(max_templates: u32, promote_threshold: u32, canonicalize: bool) -> Self {
        Self {
            bank: TemplateBank::new(),
            trackers: Vec::new(),
            rows: Vec::new(),
            mask: RowMask::default(),
            max_templates,
            promote_threshold: promote_threshold.max(1),
            canonicalize,
            overflow_reported: false,
        }
    }

    pub fn bank(&self) -> &TemplateBank {
        &self.bank
    }

    /// Ingests one line (terminator included, when present).
    pub fn push_line(&mut self, line: &[u8]) {
        let (pieces, params) = if self.canonicalize {
            let (canonical, side) = canon::canonicalize(line);
            segment(&canonical, &side)
        } else {
            segment(line, &[])
        };

        // A template needs at least two pieces and at least one slot; a
        // line with nothing variable in it is carried as a raw row.
        if pieces.len() < 2 || !pieces.iter().any(Piece::is_slot) {
            self.push_raw(line);
            return;
        }

        match self.bank.lookup_or_insert(&pieces, self.max_templates) {
            Some(tid) => {
                if tid as usize == self.trackers.len() {
                    let arity = self.bank.get(tid).arity();
                    self.trackers
                        .push((0..arity).map(|_| TypeTracker::new()).collect());
                }
                for (slot, value) in params.iter().enumerate() {
                    self.trackers[tid as usize][slot].observe(value, self.promote_threshold);
                }
                self.rows.push(Row::Templated { tid, params });
                self.mask.push(true);
            }
            None => {
                if !self.overflow_reported {
                    warn!(
                        max_templates = self.max_templates,
                        "template bank full, demoting further new shapes to raw rows"
                    );
                    self.overflow_reported = true;
                }
                self.push_raw(line);
            }
        }
    }

    fn push_raw(&mut self, line: &[u8]) {
        self.rows.push(Row::Raw {
            bytes: line.to_vec(),
        });
        self.mask.push(false);
    }

    /// Freezes the bank and locks every slot type.
    pub fn finish(mut self) -> Mined {
        self.bank.freeze();
        let mut slot_types = Vec::with_capacity(self.trackers.len());
        let mut dicts = Vec::with_capacity(self.trackers.len());
        for per_slot in self.trackers {
            let mut types = Vec::with_capacity(per_slot.len());
            let mut slot_dicts = Vec::with_capacity(per_slot.len());
            for tracker in per_slot {
                let (ty, dict) = tracker.finish();
                types.push(ty);
                slot_dicts.push(dict);
            }
            slot_types.push(types);
            dicts.push(slot_dicts);
        }
        // Templates mined but never tracked cannot exist; trackers grow with
        // the bank. Guard anyway for the degenerate empty session.
        while slot_types.len() < self.bank.len() {
            slot_types.push(Vec::new());
            dicts.push(Vec::new());
        }
        debug!(
            templates = self.bank.len(),
            rows = self.rows.len(),
            raw = self.mask.len() - self.mask.popcount(),
            "mining finished"
        );
        Mined {
            bank: self.bank,
            rows: self.rows,
            mask: self.mask,
            slot_types,
            dicts,
        }
    }
}

/// True for whole words the miner slots even without a canonicalizer hit:
/// short decimals, dotted quads, short hex with at least one digit and one
/// letter.
fn variable_shaped(word: &[u8]) -> bool {
    if word.iter().all(|b| b.is_ascii_digit()) && !word.is_empty() {
        return true;
    }
    if ip_compat(word).is_some() {
        return true;
    }
    word.len() >= 2
        && word.iter().all(|b| b.is_ascii_hexdigit())
        && word.iter().any(|b| b.is_ascii_digit())
        && word.iter().any(|b| b.is_ascii_alphabetic())
}

/// Splits a canonical line into template pieces and slot values. Sentinel
/// occurrences become slots carrying the original bytes from the side
/// vector; sentinel-free variable-shaped words become slots carrying the
/// word itself.
fn segment(canonical: &[u8], side: &[canon::SideEntry]) -> (Vec<Piece>, Vec<Vec<u8>>) {
    let mut pieces = Vec::new();
    let mut params = Vec::new();
    let mut side_cursor = 0usize;
    let mut i = 0usize;

    while i < canonical.len() {
        if canonical[i].is_ascii_whitespace() {
            let start = i;
            while i < canonical.len() && canonical[i].is_ascii_whitespace() {
                i += 1;
            }
            pieces.push(Piece::Lit(canonical[start..i].to_vec()));
            continue;
        }
        let start = i;
        while i < canonical.len() && !canonical[i].is_ascii_whitespace() {
            i += 1;
        }
        segment_word(&canonical[start..i], side, &mut side_cursor, &mut pieces, &mut params);
    }
    (pieces, params)
}

fn segment_word(
    word: &[u8],
    side: &[canon::SideEntry],
    side_cursor: &mut usize,
    pieces: &mut Vec<Piece>,
    params: &mut Vec<Vec<u8>>,
) {
    let mut frag_start = 0usize;
    let mut i = 0usize;
    let mut saw_sentinel = false;
    while i < word.len() {
        let hit = canon::SENTINELS
            .iter()
            .find(|k| word[i..].starts_with(k.sentinel()));
        if let Some(kind) = hit {
            saw_sentinel = true;
            if frag_start < i {
                pieces.push(Piece::Lit(word[frag_start..i].to_vec()));
            }
            pieces.push(Piece::Slot);
            let original = side
                .get(*side_cursor)
                .map(|e| e.bytes.clone())
                .unwrap_or_else(|| kind.sentinel().to_vec());
            *side_cursor += 1;
            params.push(original);
            i += kind.sentinel().len();
            frag_start = i;
        } else {
            i += 1;
        }
    }
    if !saw_sentinel && variable_shaped(word) {
        pieces.push(Piece::Slot);
        params.push(word.to_vec());
        return;
    }
    if frag_start < word.len() {
        pieces.push(Piece::Lit(word[frag_start..].to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mine(lines: &[&[u8]]) -> Mined {
        let mut miner = Miner::new(65_535, 8, true);
        for line in lines {
            miner.push_line(line);
        }
        miner.finish()
    }

    fn reconstruct(mined: &Mined, row: &Row) -> Vec<u8> {
        match row {
            Row::Raw { bytes } => bytes.clone(),
            Row::Templated { tid, params } => {
                let mut out = Vec::new();
                let mut cursor = 0usize;
                for piece in &mined.bank.get(*tid).pieces {
                    match piece {
                        Piece::Lit(b) => out.extend_from_slice(b),
                        Piece::Slot => {
                            out.extend_from_slice(&params[cursor]);
                            cursor += 1;
                        }
                    }
                }
                out
            }
        }
    }

    #[test]
    fn two_interleaved_templates() {
        let mined = mine(&[b"A 1\n", b"B 2\n", b"A 3\n", b"B 4\n"]);
        assert_eq!(mined.bank.len(), 2);
        match &mined.rows[2] {
            Row::Templated { tid, params } => {
                assert_eq!(*tid, 0);
                assert_eq!(params[0], b"3");
            }
            Row::Raw { .. } => panic!("expected templated row"),
        }
    }

    #[test]
    fn raw_interleaving_keeps_order() {
        let mined = mine(&[b"A 1\n", b"xxx garbage xxx\n", b"A 2\n"]);
        let bits: Vec<bool> = mined.mask.iter().collect();
        assert_eq!(bits, vec![true, false, true]);
        assert_eq!(
            mined.rows[1],
            Row::Raw {
                bytes: b"xxx garbage xxx\n".to_vec()
            }
        );
        for (row, line) in mined.rows.iter().zip([
            b"A 1\n".as_slice(),
            b"xxx garbage xxx\n".as_slice(),
            b"A 2\n".as_slice(),
        ]) {
            assert_eq!(reconstruct(&mined, row), line);
        }
    }

    #[test]
    fn empty_line_is_raw_newline() {
        let mined = mine(&[b"\n"]);
        assert_eq!(mined.rows[0], Row::Raw { bytes: b"\n".to_vec() });
        assert_eq!(mined.mask.popcount(), 0);
    }

    #[test]
    fn bank_overflow_demotes_to_raw() {
        let mut miner = Miner::new(2, 8, true);
        for word in ["alpha", "beta", "gamma", "delta"] {
            let line = format!("{word} go 1\n");
            miner.push_line(line.as_bytes());
        }
        let mined = miner.finish();
        assert_eq!(mined.bank.len(), 2);
        assert_eq!(mined.mask.popcount(), 2);
        assert!(matches!(mined.rows[2], Row::Raw { .. }));
        assert!(matches!(mined.rows[3], Row::Raw { .. }));
    }

    #[test]
    fn slot_promotes_to_int_after_threshold() {
        let lines: Vec<Vec<u8>> = (0..10).map(|i| format!("count {i}\n").into_bytes()).collect();
        let refs: Vec<&[u8]> = lines.iter().map(|l| l.as_slice()).collect();
        let mined = mine(&refs);
        assert_eq!(mined.slot_types[0][0], SlotType::Int);
        assert!(mined.dicts[0][0].is_none());
    }

    #[test]
    fn low_count_slot_stays_dict() {
        let mined = mine(&[b"v 1\n", b"v 2\n", b"v 3\n"]);
        assert_eq!(mined.slot_types[0][0], SlotType::Dict);
        assert_eq!(mined.dicts[0][0].as_deref().map(|d| d.len()), Some(3));
    }

    #[test]
    fn slot_free_lines_stay_raw() {
        let mined = mine(&[b"server started cleanly\n", b"server started cleanly\n"]);
        assert_eq!(mined.bank.len(), 0);
        assert_eq!(mined.mask.popcount(), 0);
    }

    #[test]
    fn canonicalized_params_carry_originals() {
        let mined = mine(&[b"t=1700000000 ok\n"]);
        match &mined.rows[0] {
            Row::Templated { params, .. } => assert_eq!(params[0], b"1700000000"),
            Row::Raw { .. } => panic!("expected templated row"),
        }
        assert_eq!(reconstruct(&mined, &mined.rows[0]), b"t=1700000000 ok\n");
    }

    #[test]
    fn mixed_word_splits_literal_prefix() {
        let mined = mine(&[b"blk_-1608999687919862906 recv\n"]);
        let t = mined.bank.get(0);
        assert!(t
            .pieces
            .iter()
            .any(|p| matches!(p, Piece::Lit(b) if b == b"blk_-")));
        assert_eq!(t.arity(), 1);
    }
}
