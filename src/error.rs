//! Error taxonomy shared by the encoder, decoder, and harness.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Unreadable bytes or premature EOF while decoding. Carries the byte
    /// offset within the failing block and the packet index (0 = container
    /// header / DICT, 1.. = DATA packets in order).
    #[error("malformed input at byte {offset} of packet {packet}: {what}")]
    MalformedInput {
        offset: usize,
        packet: usize,
        what: &'static str,
    },

    #[error("unsupported version {0}")]
    VersionUnsupported(u8),

    #[error("unsupported mode tag {0}")]
    ModeUnsupported(u8),

    /// Reserved for the verification harness.
    #[error("roundtrip mismatch at line {line}")]
    RoundtripMismatch { line: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn malformed(offset: usize, packet: usize, what: &'static str) -> Self {
        Self::MalformedInput {
            offset,
            packet,
            what,
        }
    }

    /// Stamps the packet index onto a malformed-input error raised while
    /// parsing inside that packet.
    pub fn at_packet(self, index: usize) -> Self {
        match self {
            Self::MalformedInput { offset, what, .. } => Self::MalformedInput {
                offset,
                packet: index,
                what,
            },
            other => other,
        }
    }

    /// CLI exit code per the external contract: 1 malformed, 2 version, 3 I/O.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MalformedInput { .. } | Self::RoundtripMismatch { .. } => 1,
            Self::VersionUnsupported(_) | Self::ModeUnsupported(_) => 2,
            Self::Io(_) => 3,
        }
    }
}
