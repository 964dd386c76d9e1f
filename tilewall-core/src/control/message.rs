//! Control-plane messages exchanged between producers, bridges, display
//! nodes and the sync coordinator.
//!
//! Messages are grouped by the subsystem that consumes them; the
//! [`MessageKind`] in the packet header names that subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::group::GroupSpec;
use crate::block::partition::{BlockPartition, Route};
use crate::block::types::PixelFormat;
use crate::bridge::alloc::Allocation;
use crate::error::WallError;
use crate::geometry::{Rect, WindowLayout};
use crate::perf::PerfReport;
use crate::streamer::config::Destination;
use crate::sync::SyncMode;
use crate::transport::StreamType;

// ── MessageKind ──────────────────────────────────────────────────

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Registration and lifecycle.
    Session = 0x1,
    /// Stream setup and layout.
    Stream = 0x2,
    /// Performance monitoring.
    Perf = 0x3,
    /// Frame synchronization.
    Sync = 0x4,
}

impl TryFrom<u32> for MessageKind {
    type Error = WallError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(MessageKind::Session),
            0x2 => Ok(MessageKind::Stream),
            0x3 => Ok(MessageKind::Perf),
            0x4 => Ok(MessageKind::Sync),
            _ => Err(WallError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── StreamInfo ───────────────────────────────────────────────────

/// Fixed parameters of one pixel stream, known to both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub image_width: u32,
    pub image_height: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub format: PixelFormat,
    pub blocks_per_group: u32,
    pub sync_mode: SyncMode,
    /// Target frames per second, 0 for unlimited.
    pub frame_rate: u32,
}

impl StreamInfo {
    pub fn group_spec(&self) -> GroupSpec {
        GroupSpec {
            block_width: self.block_width,
            block_height: self.block_height,
            format: self.format,
            blocks_per_group: self.blocks_per_group as usize,
        }
    }

    pub fn partition(&self) -> Result<BlockPartition, WallError> {
        BlockPartition::new(
            self.image_width,
            self.image_height,
            self.block_width,
            self.block_height,
        )
    }
}

/// Everything a display node needs to receive one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInit {
    pub instance: u32,
    pub stream: StreamInfo,
    /// How the sender selects blocks for this node.
    pub route: Route,
    /// This node's tiles in wall space.
    pub tiles: Vec<Rect>,
    /// Sync group the node joins, when the instance is synchronized.
    pub sync_group: Option<u32>,
    /// Bridge members relaying the instance, if it is not streamed
    /// directly.
    pub relays: Option<Allocation>,
}

impl StreamInit {
    /// Blocks a connection from `sender_id` carries. Relayed
    /// connections carry their member's range, direct ones `route`.
    pub fn route_for(&self, sender_id: u32, stream_type: StreamType) -> Route {
        if stream_type == StreamType::Relay
            && let Some(route) = self.relays.as_ref().and_then(|a| a.route_of(sender_id))
        {
            return route;
        }
        self.route.clone()
    }
}

// ── Subsystem messages ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// A producer asks to be streamed to the wall.
    Register {
        instance: u32,
        app_name: String,
        stream: StreamInfo,
        layout: WindowLayout,
        /// Instance carries an audio sub-stream (transported elsewhere).
        audio: bool,
    },
    /// Bridge reports the nodes it allocated to an instance.
    Allocated { instance: u32, allocation: Allocation },
    /// A node has its receiver for `instance` in place.
    NodeReady { instance: u32, node_id: u32 },
    /// The instance ended; release everything held for it.
    Quit { instance: u32 },
    /// The instance never became ready and was torn down.
    TimedOut { instance: u32 },
    /// Stop the receiving process.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage {
    Init(StreamInit),
    /// Layout to apply when `config_id` arrives in the pixel stream.
    DisplayUpdate {
        instance: u32,
        config_id: u32,
        layout: WindowLayout,
    },
    Depth { instance: u32, depth: f32 },
    /// Stream the instance to an additional set of nodes.
    Share {
        instance: u32,
        nodes: Vec<Destination>,
    },
    /// Bridge report: `nodes` are now fed by the relays in `allocation`.
    Shared {
        instance: u32,
        allocation: Allocation,
        nodes: Vec<u32>,
        sync_group: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerfMessage {
    Request { instance: u32, interval_ms: u64 },
    Stop { instance: u32 },
    Report {
        instance: u32,
        node_id: u32,
        report: PerfReport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    Join {
        group: u32,
        node: u32,
        mode: SyncMode,
    },
    Leave { group: u32, node: u32 },
    Ready { group: u32, node: u32, frame: u32 },
    /// Data sync: swap now.
    Release { group: u32, frame: u32 },
    /// Barrier sync phase one: swap, then enter the barrier.
    Swap { group: u32, frame: u32 },
    BarrierEnter { group: u32, node: u32, frame: u32 },
    /// Barrier sync phase two: everyone swapped, refresh.
    BarrierRelease { group: u32, frame: u32 },
    /// Clock sync: swap at `deadline_us` on the coordinator clock.
    SwapAt {
        group: u32,
        frame: u32,
        deadline_us: u64,
    },
    ClockProbe { node: u32, sent_us: u64 },
    ClockReply {
        node: u32,
        sent_us: u64,
        coordinator_us: u64,
    },
    /// The coordinator dropped `node` after a barrier timeout.
    Evicted { group: u32, node: u32 },
}

// ── ControlMessage ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    Session(SessionMessage),
    Stream(StreamMessage),
    Perf(PerfMessage),
    Sync(SyncMessage),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Session(_) => MessageKind::Session,
            ControlMessage::Stream(_) => MessageKind::Stream,
            ControlMessage::Perf(_) => MessageKind::Perf,
            ControlMessage::Sync(_) => MessageKind::Sync,
        }
    }

    /// Instance the message is about, if any.
    pub fn instance(&self) -> Option<u32> {
        match self {
            ControlMessage::Session(m) => match m {
                SessionMessage::Register { instance, .. }
                | SessionMessage::Allocated { instance, .. }
                | SessionMessage::NodeReady { instance, .. }
                | SessionMessage::Quit { instance }
                | SessionMessage::TimedOut { instance } => Some(*instance),
                SessionMessage::Shutdown => None,
            },
            ControlMessage::Stream(m) => match m {
                StreamMessage::Init(init) => Some(init.instance),
                StreamMessage::DisplayUpdate { instance, .. }
                | StreamMessage::Depth { instance, .. }
                | StreamMessage::Share { instance, .. }
                | StreamMessage::Shared { instance, .. } => Some(*instance),
            },
            ControlMessage::Perf(m) => match m {
                PerfMessage::Request { instance, .. }
                | PerfMessage::Stop { instance }
                | PerfMessage::Report { instance, .. } => Some(*instance),
            },
            ControlMessage::Sync(_) => None,
        }
    }
}

impl From<SessionMessage> for ControlMessage {
    fn from(m: SessionMessage) -> Self {
        ControlMessage::Session(m)
    }
}

impl From<StreamMessage> for ControlMessage {
    fn from(m: StreamMessage) -> Self {
        ControlMessage::Stream(m)
    }
}

impl From<PerfMessage> for ControlMessage {
    fn from(m: PerfMessage) -> Self {
        ControlMessage::Perf(m)
    }
}

impl From<SyncMessage> for ControlMessage {
    fn from(m: SyncMessage) -> Self {
        ControlMessage::Sync(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_u32() {
        for kind in [
            MessageKind::Session,
            MessageKind::Stream,
            MessageKind::Perf,
            MessageKind::Sync,
        ] {
            assert_eq!(MessageKind::try_from(kind as u32).unwrap(), kind);
        }
        assert!(MessageKind::try_from(0).is_err());
    }

    #[test]
    fn kind_follows_subsystem() {
        let m: ControlMessage = SyncMessage::Release { group: 1, frame: 2 }.into();
        assert_eq!(m.kind(), MessageKind::Sync);
        assert_eq!(m.instance(), None);

        let m: ControlMessage = SessionMessage::Quit { instance: 7 }.into();
        assert_eq!(m.kind(), MessageKind::Session);
        assert_eq!(m.instance(), Some(7));
    }

    #[test]
    fn stream_info_derives_grid() {
        let info = StreamInfo {
            image_width: 1920,
            image_height: 1080,
            block_width: 256,
            block_height: 256,
            format: PixelFormat::Rgb8,
            blocks_per_group: 8,
            sync_mode: SyncMode::None,
            frame_rate: 0,
        };
        assert_eq!(info.partition().unwrap().block_count(), 40);
        assert_eq!(info.group_spec().block_size(), 256 * 256 * 3);
    }
}
