//! DICT and DATA packet assembly and parsing.
//!
//! The DICT packet is emitted once per session and carries the frozen
//! template bank, the locked slot types, and the DICT-slot value tables.
//! Each DATA packet carries one window: row mask, MTF positions, per-slot
//! channels in (template id, slot index) order, then the raw rows.

use crate::bits::{width_for, BitReader, BitWriter};
use crate::channel::{decode_channel, encode_channel, ValueDict};
use crate::error::{CodecError, Result};
use crate::miner::{Mined, Row};
use crate::mtf::MtfList;
use crate::template::{Piece, SlotType, Template, TemplateBank, TemplateId};
use crate::varint::{put_uvarint, uvarint_len};
use hashbrown::HashMap;

pub const DICT_MAGIC: &[u8; 4] = b"USCD";
pub const DATA_MAGIC: &[u8; 4] = b"USCx";
pub const WIRE_VERSION: u8 = 1;

/// Frozen per-session tables shared by encoder and decoder.
#[derive(Clone, Debug)]
pub struct SessionTables {
    pub bank: TemplateBank,
    pub slot_types: Vec<Vec<SlotType>>,
    pub dicts: Vec<Vec<Option<ValueDict>>>,
}

impl SessionTables {
    pub fn from_mined(mined: &Mined) -> Self {
        let dicts = mined
            .dicts
            .iter()
            .map(|slots| {
                slots
                    .iter()
                    .map(|d| d.clone().map(ValueDict::from_values))
                    .collect()
            })
            .collect();
        Self {
            bank: mined.bank.clone(),
            slot_types: mined.slot_types.clone(),
            dicts,
        }
    }

    fn slot_type(&self, tid: TemplateId, slot: usize) -> SlotType {
        self.slot_types[tid as usize][slot]
    }

    fn dict(&self, tid: TemplateId, slot: usize) -> Option<&ValueDict> {
        self.dicts[tid as usize][slot].as_ref()
    }
}

/// Renders a row back to its exact line bytes.
pub fn render_row(bank: &TemplateBank, row: &Row) -> Vec<u8> {
    match row {
        Row::Raw { bytes } => bytes.clone(),
        Row::Templated { tid, params } => {
            let mut out = Vec::new();
            let mut cursor = 0usize;
            for piece in &bank.get(*tid).pieces {
                match piece {
                    Piece::Lit(bytes) => out.extend_from_slice(bytes),
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

pub fn encode_dict(tables: &SessionTables) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(DICT_MAGIC);
    out.push(WIRE_VERSION);
    put_uvarint(&mut out, tables.bank.len() as u64);

    for template in tables.bank.templates() {
        put_uvarint(&mut out, template.len() as u64);
        let mut flags = BitWriter::new();
        for piece in &template.pieces {
            flags.push(u64::from(piece.is_slot()), 1);
        }
        out.extend_from_slice(&flags.finish());
        for piece in &template.pieces {
            match piece {
                Piece::Lit(bytes) => {
                    put_uvarint(&mut out, bytes.len() as u64);
                    out.extend_from_slice(bytes);
                }
                Piece::Slot => put_uvarint(&mut out, 0),
            }
        }
    }

    for (tid, template) in tables.bank.templates().iter().enumerate() {
        for slot in 0..template.arity() {
            out.push(tables.slot_types[tid][slot] as u8);
        }
    }

    for (tid, template) in tables.bank.templates().iter().enumerate() {
        for slot in 0..template.arity() {
            if tables.slot_types[tid][slot] != SlotType::Dict {
                continue;
            }
            let dict = tables.dicts[tid][slot]
                .as_ref()
                .expect("dict slot without table");
            put_uvarint(&mut out, dict.len() as u64);
            for value in dict.values() {
                put_uvarint(&mut out, value.len() as u64);
                out.extend_from_slice(value);
            }
        }
    }
    out
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize, what: &'static str) -> Result<&'a [u8]> {
    if *pos + n > buf.len() {
        return Err(CodecError::malformed(*pos, 0, what));
    }
    let s = &buf[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn check_header(buf: &[u8], pos: &mut usize, magic: &[u8; 4]) -> Result<()> {
    let got = take(buf, pos, 4, "packet magic eof")?;
    if got != magic {
        return Err(CodecError::malformed(0, 0, "bad packet magic"));
    }
    let ver = take(buf, pos, 1, "packet version eof")?[0];
    if ver != WIRE_VERSION {
        return Err(CodecError::VersionUnsupported(ver));
    }
    Ok(())
}

pub fn parse_dict(buf: &[u8]) -> Result<SessionTables> {
    let mut pos = 0usize;
    check_header(buf, &mut pos, DICT_MAGIC)?;
    let template_count = uvarint_len(buf, &mut pos)?;

    // Counts are attacker-controlled until the payload reads bound them, so
    // capacity is not pre-reserved from them.
    let mut templates = Vec::new();
    for _ in 0..template_count {
        let token_count = uvarint_len(buf, &mut pos)?;
        let flag_bytes = take(buf, &mut pos, (token_count + 7) / 8, "flag vector eof")?;
        let mut flags = BitReader::new(flag_bytes);
        let mut is_slot = Vec::with_capacity(token_count);
        for _ in 0..token_count {
            is_slot.push(flags.pull(1)? == 1);
        }
        let mut pieces = Vec::with_capacity(token_count);
        for &slot in &is_slot {
            let len = uvarint_len(buf, &mut pos)?;
            let bytes = take(buf, &mut pos, len, "token bytes eof")?;
            if slot {
                if len != 0 {
                    return Err(CodecError::malformed(pos, 0, "placeholder token with bytes"));
                }
                pieces.push(Piece::Slot);
            } else {
                pieces.push(Piece::Lit(bytes.to_vec()));
            }
        }
        templates.push(Template::new(pieces));
    }

    let mut slot_types = Vec::with_capacity(template_count);
    for template in &templates {
        let arity = template.arity();
        let tags = take(buf, &mut pos, arity, "slot type table eof")?;
        let mut types = Vec::with_capacity(arity);
        for &tag in tags {
            types.push(
                SlotType::from_tag(tag)
                    .ok_or_else(|| CodecError::malformed(pos, 0, "unknown slot type tag"))?,
            );
        }
        slot_types.push(types);
    }

    let mut dicts: Vec<Vec<Option<ValueDict>>> = Vec::with_capacity(template_count);
    for (tid, template) in templates.iter().enumerate() {
        let mut slot_dicts = Vec::with_capacity(template.arity());
        for slot in 0..template.arity() {
            if slot_types[tid][slot] != SlotType::Dict {
                slot_dicts.push(None);
                continue;
            }
            let entry_count = uvarint_len(buf, &mut pos)?;
            let mut values = Vec::new();
            for _ in 0..entry_count {
                let len = uvarint_len(buf, &mut pos)?;
                values.push(take(buf, &mut pos, len, "dict entry eof")?.to_vec());
            }
            slot_dicts.push(Some(ValueDict::from_values(values)));
        }
        dicts.push(slot_dicts);
    }

    if pos != buf.len() {
        return Err(CodecError::malformed(pos, 0, "trailing bytes in dict packet"));
    }

    Ok(SessionTables {
        bank: TemplateBank::from_templates(templates),
        slot_types,
        dicts,
    })
}

pub fn encode_data(tables: &SessionTables, rows: &[Row], mtf: &mut MtfList) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(DATA_MAGIC);
    out.push(WIRE_VERSION);
    put_uvarint(&mut out, rows.len() as u64);

    let mut mask = BitWriter::new();
    for row in rows {
        mask.push(u64::from(matches!(row, Row::Templated { .. })), 1);
    }
    out.extend_from_slice(&mask.finish());

    let width = width_for(tables.bank.len());
    let mut positions = BitWriter::new();
    let mut channel_values: HashMap<(TemplateId, usize), Vec<Vec<u8>>> = HashMap::new();
    for row in rows {
        if let Row::Templated { tid, params } = row {
            positions.push(mtf.encode(*tid), width);
            for (slot, value) in params.iter().enumerate() {
                channel_values
                    .entry((*tid, slot))
                    .or_default()
                    .push(value.clone());
            }
        }
    }
    let mtf_bytes = positions.finish();
    put_uvarint(&mut out, mtf_bytes.len() as u64);
    out.extend_from_slice(&mtf_bytes);

    let mut pairs: Vec<(TemplateId, usize)> = channel_values.keys().copied().collect();
    pairs.sort_unstable();
    for (tid, slot) in pairs {
        let values = &channel_values[&(tid, slot)];
        encode_channel(
            &mut out,
            tables.slot_type(tid, slot),
            tables.dict(tid, slot),
            values,
        );
    }

    for row in rows {
        if let Row::Raw { bytes } = row {
            put_uvarint(&mut out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
    }
    out
}

pub fn parse_data(
    buf: &[u8],
    tables: &SessionTables,
    mtf: &mut MtfList,
    packet_index: usize,
) -> Result<Vec<Row>> {
    parse_data_inner(buf, tables, mtf).map_err(|e| e.at_packet(packet_index))
}

fn parse_data_inner(buf: &[u8], tables: &SessionTables, mtf: &mut MtfList) -> Result<Vec<Row>> {
    let mut pos = 0usize;
    check_header(buf, &mut pos, DATA_MAGIC)?;
    let row_count = uvarint_len(buf, &mut pos)?;

    let mask_bytes = take(buf, &mut pos, (row_count + 7) / 8, "row mask eof")?;
    let mut mask_bits = Vec::with_capacity(row_count);
    let mut mask_reader = BitReader::new(mask_bytes);
    for _ in 0..row_count {
        mask_bits.push(mask_reader.pull(1)? == 1);
    }
    let templated_count = mask_bits.iter().filter(|&&b| b).count();

    let mtf_len = uvarint_len(buf, &mut pos)?;
    let mtf_bytes = take(buf, &mut pos, mtf_len, "mtf block eof")?;
    let width = width_for(tables.bank.len());
    let mut positions = BitReader::new(mtf_bytes);
    let mut tids = Vec::with_capacity(templated_count);
    for _ in 0..templated_count {
        let p = positions.pull(width)?;
        let tid = mtf
            .decode(p)
            .ok_or_else(|| CodecError::malformed(pos, 0, "mtf position out of range"))?;
        tids.push(tid);
    }

    let mut counts: HashMap<TemplateId, usize> = HashMap::new();
    for &tid in &tids {
        *counts.entry(tid).or_default() += 1;
    }
    let mut pairs: Vec<(TemplateId, usize)> = Vec::new();
    for (&tid, _) in counts.iter() {
        if tid as usize >= tables.bank.len() {
            return Err(CodecError::malformed(pos, 0, "template id out of range"));
        }
        for slot in 0..tables.bank.get(tid).arity() {
            pairs.push((tid, slot));
        }
    }
    pairs.sort_unstable();

    let mut channels: HashMap<(TemplateId, usize), std::collections::VecDeque<Vec<u8>>> =
        HashMap::with_capacity(pairs.len());
    for (tid, slot) in pairs {
        let values = decode_channel(
            buf,
            &mut pos,
            tables.slot_type(tid, slot),
            tables.dict(tid, slot),
            counts[&tid],
        )?;
        channels.insert((tid, slot), values.into());
    }

    let mut rows = Vec::with_capacity(row_count);
    let mut tid_iter = tids.into_iter();
    let mut raw_pending = Vec::new();
    for &templated in &mask_bits {
        if templated {
            let tid = tid_iter.next().expect("mask/position count mismatch");
            let arity = tables.bank.get(tid).arity();
            let mut params = Vec::with_capacity(arity);
            for slot in 0..arity {
                let value = channels
                    .get_mut(&(tid, slot))
                    .and_then(|q| q.pop_front())
                    .ok_or_else(|| CodecError::malformed(pos, 0, "channel underrun"))?;
                params.push(value);
            }
            rows.push(Row::Templated { tid, params });
        } else {
            raw_pending.push(rows.len());
            rows.push(Row::Raw { bytes: Vec::new() });
        }
    }
    for idx in raw_pending {
        let len = uvarint_len(buf, &mut pos)?;
        let bytes = take(buf, &mut pos, len, "raw row eof")?.to_vec();
        rows[idx] = Row::Raw { bytes };
    }

    if pos != buf.len() {
        return Err(CodecError::malformed(pos, 0, "trailing bytes in data packet"));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::Miner;

    fn mine(lines: &[&[u8]]) -> Mined {
        let mut miner = Miner::new(65_535, 2, true);
        for line in lines {
            miner.push_line(line);
        }
        miner.finish()
    }

    fn roundtrip_window(lines: &[&[u8]]) {
        let mined = mine(lines);
        let tables = SessionTables::from_mined(&mined);

        let dict_bytes = encode_dict(&tables);
        let decoded_tables = parse_dict(&dict_bytes).unwrap();
        assert_eq!(decoded_tables.bank.templates(), tables.bank.templates());
        assert_eq!(decoded_tables.slot_types, tables.slot_types);

        let mut enc_mtf = MtfList::new(tables.bank.len());
        let data = encode_data(&tables, &mined.rows, &mut enc_mtf);
        let mut dec_mtf = MtfList::new(decoded_tables.bank.len());
        let rows = parse_data(&data, &decoded_tables, &mut dec_mtf, 1).unwrap();

        let rendered: Vec<Vec<u8>> = rows
            .iter()
            .map(|r| render_row(&decoded_tables.bank, r))
            .collect();
        let expect: Vec<Vec<u8>> = lines.iter().map(|l| l.to_vec()).collect();
        assert_eq!(rendered, expect);
    }

    #[test]
    fn dict_and_data_roundtrip() {
        roundtrip_window(&[
            b"A 1\n",
            b"B 2\n",
            b"A 3\n",
            b"B 4\n",
            b"junk line here\n",
            b"A 5\n",
        ]);
    }

    #[test]
    fn mixed_types_roundtrip() {
        roundtrip_window(&[
            b"conn from 10.0.0.1 id cafe01\n",
            b"conn from 10.0.0.2 id cafe02\n",
            b"conn from 10.0.0.3 id cafe03\n",
            b"ts 1700000001 ev start\n",
            b"ts 1700000002 ev start\n",
        ]);
    }

    #[test]
    fn dict_packet_rejects_bad_version() {
        let mined = mine(&[b"A 1\n"]);
        let tables = SessionTables::from_mined(&mined);
        let mut bytes = encode_dict(&tables);
        bytes[4] = 99;
        assert!(matches!(
            parse_dict(&bytes),
            Err(CodecError::VersionUnsupported(99))
        ));
    }

    #[test]
    fn data_packet_truncation_is_positioned() {
        let mined = mine(&[b"A 1\n", b"A 2\n"]);
        let tables = SessionTables::from_mined(&mined);
        let mut mtf = MtfList::new(tables.bank.len());
        let mut data = encode_data(&tables, &mined.rows, &mut mtf);
        data.truncate(data.len() - 1);
        let mut dec_mtf = MtfList::new(tables.bank.len());
        match parse_data(&data, &tables, &mut dec_mtf, 3) {
            Err(CodecError::MalformedInput { packet, .. }) => assert_eq!(packet, 3),
            other => panic!("expected malformed input, got {other:?}"),
        }
    }

    #[test]
    fn raw_only_window() {
        roundtrip_window(&[b"\n", b"no slots at all\n", b"\n"]);
    }
}
