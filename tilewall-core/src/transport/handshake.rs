//! Connection handshake: a fixed-size text record sent once by the
//! connecting side before any group data.
//!
//! ```text
//! "senderID streamType frameRate instanceID\0\0 ..."   (HANDSHAKE_SIZE bytes)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WallError;

pub const HANDSHAKE_SIZE: usize = 128;

/// What flows over a data connection.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// Pixel groups straight from a producer.
    Pixel = 1,
    /// Pixel groups forwarded by a bridge.
    Relay = 2,
    /// Audio sub-stream; carried elsewhere, the handshake only tags it.
    Audio = 3,
}

impl TryFrom<u32> for StreamType {
    type Error = WallError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StreamType::Pixel),
            2 => Ok(StreamType::Relay),
            3 => Ok(StreamType::Audio),
            _ => Err(WallError::UnknownVariant {
                type_name: "StreamType",
                value: value as u64,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub sender_id: u32,
    pub stream_type: StreamType,
    pub frame_rate: u32,
    pub instance_id: u32,
}

impl Handshake {
    pub fn new(sender_id: u32, stream_type: StreamType, frame_rate: u32, instance_id: u32) -> Self {
        Self {
            sender_id,
            stream_type,
            frame_rate,
            instance_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let text = format!(
            "{} {} {} {}",
            self.sender_id, self.stream_type as u32, self.frame_rate, self.instance_id
        );
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WallError> {
        if bytes.len() < HANDSHAKE_SIZE {
            return Err(WallError::MalformedHeader(format!(
                "handshake too short: {} < {HANDSHAKE_SIZE}",
                bytes.len()
            )));
        }
        let end = bytes[..HANDSHAKE_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HANDSHAKE_SIZE);
        let text = std::str::from_utf8(&bytes[..end])
            .map_err(|e| WallError::MalformedHeader(e.to_string()))?;
        let fields: Vec<&str> = text.split_ascii_whitespace().collect();
        if fields.len() < 4 {
            return Err(WallError::MalformedHeader(format!(
                "handshake needs 4 fields, got {:?}",
                text
            )));
        }
        Ok(Self {
            sender_id: fields[0].parse()?,
            stream_type: StreamType::try_from(fields[1].parse::<u32>()?)?,
            frame_rate: fields[2].parse()?,
            instance_id: fields[3].parse()?,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WallError> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a complete handshake; an early EOF is `PeerClosed`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WallError> {
        let mut raw = [0u8; HANDSHAKE_SIZE];
        match reader.read_exact(&mut raw).await {
            Ok(_) => Self::from_bytes(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WallError::PeerClosed),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sender {} {:?} @{}fps instance {}",
            self.sender_id, self.stream_type, self.frame_rate, self.instance_id
        )
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[test]
    fn text_layout() {
        let h = Handshake::new(3, StreamType::Relay, 60, 12);
        let bytes = h.to_bytes();
        assert!(bytes.starts_with(b"3 2 60 12\0"));
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn short_record_is_rejected() {
        let mut bytes = [0u8; HANDSHAKE_SIZE];
        bytes[..5].copy_from_slice(b"1 1 0");
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn unknown_stream_type() {
        let mut bytes = [0u8; HANDSHAKE_SIZE];
        bytes[..7].copy_from_slice(b"1 9 0 1");
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(WallError::UnknownVariant { .. })
        ));
    }

    #[tokio::test]
    async fn read_in_pieces() {
        let bytes = Handshake::new(1, StreamType::Pixel, 30, 5).to_bytes();
        let mut reader = Builder::new().read(&bytes[..10]).read(&bytes[10..]).build();
        let h = Handshake::read_from(&mut reader).await.unwrap();
        assert_eq!(h.instance_id, 5);
    }

    #[tokio::test]
    async fn eof_before_handshake() {
        let mut reader = Builder::new().read(b"1 1").build();
        assert!(matches!(
            Handshake::read_from(&mut reader).await,
            Err(WallError::PeerClosed)
        ));
    }
}
