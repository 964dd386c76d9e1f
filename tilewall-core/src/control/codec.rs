use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::control::header::{CONTROL_HEADER_SIZE, ControlHeader};
use crate::control::message::ControlMessage;
use crate::control::packet::{ControlPacket, MAX_PAYLOAD_SIZE};
use crate::error::WallError;

/// Frames [`ControlMessage`]s on a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = WallError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < CONTROL_HEADER_SIZE {
            return Ok(None);
        }
        let header = ControlHeader::from_bytes(&src[..CONTROL_HEADER_SIZE])?;
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WallError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let frame_len = CONTROL_HEADER_SIZE + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let payload = frame.split_off(CONTROL_HEADER_SIZE).freeze();
        let packet = ControlPacket::from_parts(header, payload)?;
        packet.to_message().map(Some)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = WallError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ControlPacket::from_message(&item)?.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::{PerfMessage, SessionMessage, SyncMessage};

    fn encoded(msg: ControlMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        ControlCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let msg: ControlMessage = PerfMessage::Request {
            instance: 2,
            interval_ms: 500,
        }
        .into();
        let full = encoded(msg.clone());

        let mut partial = BytesMut::from(&full[..CONTROL_HEADER_SIZE + 1]);
        assert!(ControlCodec.decode(&mut partial).unwrap().is_none());

        let mut whole = full.clone();
        assert_eq!(ControlCodec.decode(&mut whole).unwrap(), Some(msg));
        assert!(whole.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let a: ControlMessage = SyncMessage::Join {
            group: 1,
            node: 4,
            mode: crate::sync::SyncMode::BarrierSync,
        }
        .into();
        let b: ControlMessage = SessionMessage::Shutdown.into();
        let mut buf = encoded(a.clone());
        buf.extend_from_slice(&encoded(b.clone()));

        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_length_is_rejected_early() {
        let header = ControlHeader::new(
            crate::control::message::MessageKind::Session,
            0,
            (MAX_PAYLOAD_SIZE + 1) as u64,
        );
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        assert!(matches!(
            ControlCodec.decode(&mut buf),
            Err(WallError::PayloadTooLarge { .. })
        ));
    }
}
