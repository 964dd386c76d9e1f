//! Launches the configured role and keeps it running until stopped.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tilewall_core::{Bridge, DisplayNode, NodeEvent, SyncServer, WallContext, WallError};

use crate::config::{Role, WallConfig};

const PRESENT_QUEUE: usize = 64;

// ── WallService ──────────────────────────────────────────────────

/// One wall process: a bridge member, a display node or the sync
/// coordinator.
pub struct WallService {
    config: WallConfig,
    ctx: WallContext,
}

impl WallService {
    pub fn new(config: WallConfig) -> Self {
        let node_id = match config.role {
            Role::Bridge => config.bridge.node_id,
            Role::Display => config.display.node_id,
            Role::Sync => 0,
        };
        let ctx = WallContext::new(node_id, config.network.clone());
        Self { config, ctx }
    }

    /// Context whose shutdown stops the service from another task.
    pub fn context(&self) -> &WallContext {
        &self.ctx
    }

    pub fn stop(&self) {
        self.ctx.shutdown();
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.is_shutting_down()
    }

    /// Run the configured role until stopped.
    pub async fn run(&self) -> Result<(), WallError> {
        info!(role = ?self.config.role, node = self.ctx.node_id(), "starting");
        match self.config.role {
            Role::Bridge => {
                self.config.bridge.validate()?;
                let bridge = Bridge::bind(self.ctx.clone(), self.config.bridge.clone()).await?;
                bridge.run().await?;
            }
            Role::Display => {
                let node = DisplayNode::bind(self.ctx.clone(), self.config.display.clone()).await?;
                let (tx, rx) = mpsc::channel(PRESENT_QUEUE);
                let presenter = tokio::spawn(present(rx));
                node.run(tx).await?;
                let _ = presenter.await;
            }
            Role::Sync => {
                let server = SyncServer::bind(
                    &self.config.network.bind_host,
                    self.config.sync.clone(),
                    self.ctx.cancel_token().clone(),
                )
                .await?;
                server.run().await?;
            }
        }
        info!(role = ?self.config.role, "stopped");
        Ok(())
    }
}

/// Presentation lives outside this process; log what would be drawn.
async fn present(mut events: mpsc::Receiver<NodeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::Swapped {
                instance,
                frame,
                depth,
                front,
            } => debug!(
                instance,
                frame,
                depth,
                montages = front.iter().flatten().count(),
                "frame shown"
            ),
            NodeEvent::Refresh { instance, frame } => debug!(instance, frame, "refresh"),
            NodeEvent::Cleared { instance } => info!(instance, "window cleared"),
            NodeEvent::Depth { instance, depth } => debug!(instance, depth, "depth changed"),
            NodeEvent::Quit { instance, reason } => warn!(instance, %reason, "instance ended"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
