//! Interchangeable group transports.
//!
//! [`TcpTransport`] is reliable and ordered; [`UdpTransport`] sends one
//! group per datagram on a best-effort basis. Both hand out opaque
//! [`ConnId`]s and speak the same handshake and group format, so the
//! streamer, bridge and display node are written against the
//! [`Transport`] trait only.

pub mod handshake;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::group::BlockGroup;
use crate::block::header::{GroupFlag, GroupHeader};

pub use handshake::{HANDSHAKE_SIZE, Handshake, StreamType};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use crate::error::WallError;

/// Identifies one connection inside a transport.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

/// Socket settings shared by both transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub transport: TransportKind,
    /// Address listeners bind to.
    pub bind_host: String,
    /// Socket send buffer in bytes.
    pub send_buffer: u32,
    /// Socket receive buffer in bytes.
    pub recv_buffer: u32,
    pub nodelay: bool,
    /// Largest datagram the UDP transport sends or accepts.
    pub max_datagram: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            bind_host: "0.0.0.0".to_string(),
            send_buffer: 8 * 1024 * 1024,
            recv_buffer: 8 * 1024 * 1024,
            nodelay: true,
            max_datagram: 65_507,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting connections on `port` (0 picks a free port).
    async fn listen(&self, port: u16) -> Result<SocketAddr, WallError>;

    /// Wait for the next peer and its handshake.
    async fn accept_connection(&self) -> Result<(ConnId, Handshake), WallError>;

    async fn connect(&self, host: &str, port: u16, handshake: &Handshake)
    -> Result<ConnId, WallError>;

    /// Send one group. Returns bytes written.
    async fn send_group(&self, conn: ConnId, group: &BlockGroup) -> Result<usize, WallError>;

    /// Receive one group into `group`, classifying control groups.
    /// Returns bytes read.
    async fn recv_group(&self, conn: ConnId, group: &mut BlockGroup) -> Result<usize, WallError>;

    /// Header of the next group if it has fully arrived, without
    /// consuming it. Never waits: `None` while nothing complete is
    /// buffered or a receive is in progress.
    async fn peek_header(&self, conn: ConnId) -> Result<Option<GroupHeader>, WallError>;

    async fn close(&self, conn: ConnId) -> Result<(), WallError>;

    fn kind(&self) -> TransportKind;
}

/// Build the transport named by `config`.
pub fn from_config(config: &NetConfig) -> Arc<dyn Transport> {
    match config.transport {
        TransportKind::Tcp => Arc::new(TcpTransport::new(config.clone())),
        TransportKind::Udp => Arc::new(UdpTransport::new(config.clone())),
    }
}

// ── Receive-side bookkeeping ─────────────────────────────────────

/// Per-connection state kept by the receiving end.
#[derive(Debug, Default)]
pub(crate) struct RecvState {
    /// Header already pulled off the wire by `peek_header`.
    pub pending: Option<GroupHeader>,
    pub last_config_id: Option<u32>,
}

impl RecvState {
    /// Tag a freshly read group as data, config update or end of frame.
    pub fn classify(&mut self, group: &mut BlockGroup) {
        let flag = group.header().classify(self.last_config_id);
        if flag == GroupFlag::ConfigUpdate {
            let id = group.config_id();
            self.last_config_id = Some(self.last_config_id.map_or(id, |last| last.max(id)));
        }
        group.set_flag(flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::GroupSpec;
    use crate::block::types::PixelFormat;

    #[test]
    fn classification_tracks_config_ids() {
        let spec = GroupSpec {
            block_width: 2,
            block_height: 2,
            format: PixelFormat::Luminance8,
            blocks_per_group: 1,
        };
        let mut state = RecvState::default();
        let mut g = BlockGroup::data(&spec);

        g.apply_header(GroupHeader::control(0, 1)).unwrap();
        state.classify(&mut g);
        assert_eq!(g.flag(), GroupFlag::ConfigUpdate);

        g.apply_header(GroupHeader::control(1, 1)).unwrap();
        state.classify(&mut g);
        assert_eq!(g.flag(), GroupFlag::EndFrame);

        g.apply_header(GroupHeader::control(1, 2)).unwrap();
        state.classify(&mut g);
        assert_eq!(g.flag(), GroupFlag::ConfigUpdate);
        assert_eq!(state.last_config_id, Some(2));
    }

    #[test]
    fn stamped_control_groups_survive_reordering() {
        let spec = GroupSpec {
            block_width: 2,
            block_height: 2,
            format: PixelFormat::Luminance8,
            blocks_per_group: 1,
        };
        let mut state = RecvState::default();
        let mut g = BlockGroup::data(&spec);

        // The end of frame 3 overtakes the layout it was stamped with.
        g.apply_header(GroupHeader::control(3, 2).with_kind(GroupFlag::EndFrame)).unwrap();
        state.classify(&mut g);
        assert_eq!(g.flag(), GroupFlag::EndFrame);
        assert_eq!(state.last_config_id, None);

        g.apply_header(GroupHeader::control(3, 2).with_kind(GroupFlag::ConfigUpdate)).unwrap();
        state.classify(&mut g);
        assert_eq!(g.flag(), GroupFlag::ConfigUpdate);

        // A late, older layout does not roll the id back.
        g.apply_header(GroupHeader::control(2, 1).with_kind(GroupFlag::ConfigUpdate)).unwrap();
        state.classify(&mut g);
        assert_eq!(state.last_config_id, Some(2));
    }

    #[test]
    fn net_config_defaults() {
        let c = NetConfig::default();
        assert_eq!(c.transport, TransportKind::Tcp);
        assert!(c.nodelay);
    }
}
