//! Control plane: typed messages, their framed binary encoding and the
//! connections that carry them.

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod header;
pub mod message;
pub mod packet;

pub use codec::ControlCodec;
pub use connection::{ControlConnection, ControlSender};
pub use dispatch::{PeerId, PerfHandler, SessionHandler, StreamHandler, SyncHandler, dispatch};
pub use header::{CONTROL_HEADER_SIZE, ControlHeader};
pub use message::{
    ControlMessage, MessageKind, PerfMessage, SessionMessage, StreamInfo, StreamInit,
    StreamMessage, SyncMessage,
};
pub use packet::{ControlPacket, MAX_PAYLOAD_SIZE};
