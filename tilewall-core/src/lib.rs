//! # tilewall-core
//!
//! Pixel-streaming engine for tiled display walls.
//!
//! This crate contains:
//! - **Block**: `PixelBlock`, `BlockGroup`, the text group header and the
//!   `BlockPool` free lists that bound memory on both ends
//! - **Transport**: `Transport` trait with TCP and UDP data links
//! - **Control**: framed, checksummed control messages and their dispatch
//! - **Streamer**: producer-side double buffer and background send path
//! - **Download**: display-side reassembly of groups into tile montages
//! - **Sync**: data, barrier and clock-compensated swap coordination
//! - **Bridge**: node allocation and relay fan-out between producers and
//!   the wall
//! - **Node**: display-node manager running one downloader per instance
//! - **Task**: `WorkerSet` for tracking spawned async work with cancellation
//! - **Error**: `WallError`, a typed `thiserror`-based error hierarchy

pub mod block;
pub mod bridge;
pub mod context;
pub mod control;
pub mod download;
pub mod error;
pub mod geometry;
pub mod node;
pub mod perf;
pub mod streamer;
pub mod sync;
pub mod task;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use block::{BlockGroup, BlockPool, FrameBuffer, GroupFlag, GroupSpec, PixelBlock, PixelFormat, Route};
pub use bridge::{Allocation, AllocationPolicy, Allocator, Bridge, BridgeConfig, MemberConfig};
pub use context::{WallContext, now_us};
pub use control::{ControlConnection, ControlMessage, StreamInfo, StreamInit};
pub use download::{DownloadEvent, Downloader, Montage};
pub use error::{TaskError, WallError};
pub use geometry::{Rect, Rotation, WindowLayout};
pub use node::{DisplayNode, NodeConfig, NodeEvent};
pub use perf::{PerfCounter, PerfReport};
pub use streamer::{Destination, StreamEvent, Streamer, StreamerConfig, SwapMode, SwapOutcome};
pub use sync::{SyncClient, SyncConfig, SyncCoordinator, SyncMode, SyncServer};
pub use task::{WorkerEvent, WorkerSet};
pub use transport::{Handshake, NetConfig, StreamType, TcpTransport, Transport, TransportKind, UdpTransport};
