//! Unified State Codec - lossless template-mined compression for logs and
//! agent traces.
//!
//! Lines are canonicalized (volatile tokens become sentinels), mined into a
//! bank of templates with typed parameter slots, and encoded on separate
//! channels: MTF-transformed template ids, per-slot typed value streams,
//! and a row mask that lets raw lines interleave. A DICT packet carries the
//! frozen bank once; DATA packets stay small forever after. Cold mode adds
//! an outer zstd pass with a trained dictionary.

pub mod bench;
pub mod bits;
pub mod canon;
pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod index;
pub mod miner;
pub mod mtf;
pub mod packet;
pub mod template;
pub mod tier;
pub mod varint;

pub use bench::{bench_encode, verify_lossless, BenchResult};
pub use canon::{canonicalize, uncanonicalize, SideEntry, SideKind};
pub use codec::{
    decode_container, decode_lines, encode_lines, join_lines, split_lines, CodecConfig,
    DecodedContainer, Encoded, EncodeStats, Mode,
};
pub use error::{CodecError, Result};
pub use index::EventIndex;
pub use miner::{Mined, Miner, Row, RowMask};
pub use template::{Piece, SlotType, Template, TemplateBank, TemplateId};
pub use tier::{CommitLog, Decoded, Tier};
