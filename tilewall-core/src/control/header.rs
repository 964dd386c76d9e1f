//! Binary header of control-plane packets.
//!
//! Layout (little-endian, 24 bytes):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic (`TWL0`)   |
//! | 4      | 4    | checksum         |
//! | 8      | 4    | message kind     |
//! | 12     | 4    | reserved         |
//! | 16     | 8    | payload length   |

use crate::control::message::MessageKind;
use crate::error::WallError;

pub const MAGIC: [u8; 4] = *b"TWL0";

pub const CONTROL_HEADER_SIZE: usize = 24;

pub type ControlHeaderBytes = [u8; CONTROL_HEADER_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub checksum: u32,
    pub kind: MessageKind,
    pub payload_length: u64,
}

impl ControlHeader {
    pub fn new(kind: MessageKind, checksum: u32, payload_length: u64) -> Self {
        Self {
            checksum,
            kind,
            payload_length,
        }
    }

    pub fn to_bytes(&self) -> ControlHeaderBytes {
        let mut out: ControlHeaderBytes = [0; CONTROL_HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        out[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        // 12..16 reserved, zero.
        out[16..24].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WallError> {
        if bytes.len() < CONTROL_HEADER_SIZE {
            return Err(WallError::MalformedHeader(format!(
                "control header too short: {} < {CONTROL_HEADER_SIZE}",
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(WallError::InvalidMagic);
        }
        let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[16..24]);
        Ok(Self {
            checksum,
            kind: MessageKind::try_from(kind)?,
            payload_length: u64::from_le_bytes(len),
        })
    }
}

/// First four bytes of the blake3 digest, as carried in the header.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = blake3::hash(payload);
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
