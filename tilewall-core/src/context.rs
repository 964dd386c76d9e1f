//! Per-process handle passed to every component at construction.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::transport::{self, NetConfig, Transport};

/// Identity, shutdown signal and transport of one running role.
#[derive(Clone)]
pub struct WallContext {
    node_id: u32,
    cancel: CancellationToken,
    net: Arc<NetConfig>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for WallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallContext")
            .field("node_id", &self.node_id)
            .field("transport", &self.transport.kind())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl WallContext {
    pub fn new(node_id: u32, net: NetConfig) -> Self {
        let transport = transport::from_config(&net);
        Self {
            node_id,
            cancel: CancellationToken::new(),
            net: Arc::new(net),
            transport,
        }
    }

    /// Use an already built transport, e.g. one shared with a test.
    pub fn with_transport(node_id: u32, net: NetConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            node_id,
            cancel: CancellationToken::new(),
            net: Arc::new(net),
            transport,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn net(&self) -> &NetConfig {
        &self.net
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A context sharing everything but with its own child token, so a
    /// component can be stopped without stopping its owner.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wall-clock microseconds, the time base of clock-compensated sync.
    pub fn now_us(&self) -> u64 {
        now_us()
    }
}

pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let ctx = WallContext::new(3, NetConfig::default());
        let child = ctx.child();
        child.shutdown();
        assert!(child.is_shutting_down());
        assert!(!ctx.is_shutting_down());

        let other = ctx.child();
        ctx.shutdown();
        assert!(other.is_shutting_down());
        assert_eq!(other.node_id(), 3);
    }

    #[test]
    fn clock_moves_forward() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
        assert!(a > 0);
    }
}
