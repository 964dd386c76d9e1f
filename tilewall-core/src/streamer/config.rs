use serde::{Deserialize, Serialize};

use crate::block::partition::Route;
use crate::block::types::PixelFormat;
use crate::control::message::StreamInfo;
use crate::error::WallError;
use crate::geometry::{Rect, WindowLayout};
use crate::sync::SyncMode;

/// One receiver of a pixel stream: a display node or a bridge member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub node_id: u32,
    pub host: String,
    pub port: u16,
    pub route: Route,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub instance: u32,
    /// Id announced in the handshake.
    pub sender_id: u32,
    pub app_name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub blocks_per_group: u32,
    pub format: PixelFormat,
    pub sync_mode: SyncMode,
    /// Upper bound on transmitted frames per second, 0 for unlimited.
    pub frame_rate: u32,
    /// Data groups in the send pool, shared by all destinations.
    pub pool_groups: usize,
    pub destinations: Vec<Destination>,
    pub layout: WindowLayout,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            instance: 1,
            sender_id: 0,
            app_name: "app".to_string(),
            image_width: 1920,
            image_height: 1080,
            block_width: 256,
            block_height: 256,
            blocks_per_group: 8,
            format: PixelFormat::Rgb8,
            sync_mode: SyncMode::None,
            frame_rate: 0,
            pool_groups: 16,
            destinations: Vec::new(),
            layout: WindowLayout::new(Rect::new(0, 0, 1920, 1080), Default::default()),
        }
    }
}

impl StreamerConfig {
    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            image_width: self.image_width,
            image_height: self.image_height,
            block_width: self.block_width,
            block_height: self.block_height,
            format: self.format,
            blocks_per_group: self.blocks_per_group,
            sync_mode: self.sync_mode,
            frame_rate: self.frame_rate,
        }
    }

    pub fn validate(&self) -> Result<(), WallError> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(WallError::InvalidConfig("image size must be non-zero".into()));
        }
        if self.block_width == 0 || self.block_height == 0 {
            return Err(WallError::InvalidConfig("block size must be non-zero".into()));
        }
        if self.blocks_per_group == 0 {
            return Err(WallError::InvalidConfig("groups must hold at least one block".into()));
        }
        if self.pool_groups == 0 {
            return Err(WallError::InvalidConfig("send pool must not be empty".into()));
        }
        Ok(())
    }
}
