use bytes::{BufMut, Bytes, BytesMut};

use crate::control::header::{CONTROL_HEADER_SIZE, ControlHeader, payload_checksum};
use crate::control::message::{ControlMessage, MessageKind};
use crate::error::WallError;

/// Largest payload a control packet may carry.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Largest buffered frame the decoder accepts before giving up.
pub const MAX_FRAME_SIZE: usize = CONTROL_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// A header plus its bincode payload.
#[derive(Debug, Clone)]
pub struct ControlPacket {
    header: ControlHeader,
    payload: Bytes,
}

impl ControlPacket {
    pub fn from_message(message: &ControlMessage) -> Result<Self, WallError> {
        let payload = bincode::serialize(message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WallError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = ControlHeader::new(
            message.kind(),
            payload_checksum(&payload),
            payload.len() as u64,
        );
        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }

    /// Build a packet from a parsed header and the bytes that followed it.
    pub fn from_parts(header: ControlHeader, payload: Bytes) -> Result<Self, WallError> {
        if payload.len() as u64 != header.payload_length {
            return Err(WallError::MalformedHeader(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_length
            )));
        }
        let packet = Self { header, payload };
        packet.validate()?;
        Ok(packet)
    }

    pub fn header(&self) -> &ControlHeader {
        &self.header
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn validate(&self) -> Result<(), WallError> {
        if payload_checksum(&self.payload) != self.header.checksum {
            return Err(WallError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Decode the payload; the embedded variant must agree with the
    /// header kind.
    pub fn to_message(&self) -> Result<ControlMessage, WallError> {
        let message: ControlMessage = bincode::deserialize(&self.payload)?;
        if message.kind() != self.header.kind {
            return Err(WallError::Encoding(format!(
                "header kind {} carries a {} message",
                self.header.kind,
                message.kind()
            )));
        }
        Ok(message)
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(CONTROL_HEADER_SIZE + self.payload.len());
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
    }
}
