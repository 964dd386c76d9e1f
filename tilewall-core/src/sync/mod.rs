//! Frame synchronization across display nodes.
//!
//! A [`SyncCoordinator`] gathers `Ready` reports from the members of a
//! sync group and decides when they may swap. A [`SyncClient`] lives on
//! each display node and turns coordinator messages into swap actions.
//!
//! | Mode               | Release                                      |
//! |--------------------|----------------------------------------------|
//! | `None`             | nodes swap on their own                      |
//! | `DataSync`         | `Release` once all are ready                 |
//! | `BarrierSync`      | `Swap`, then `BarrierRelease` once all swapped |
//! | `ClockCompensated` | `SwapAt` a deadline on the coordinator clock |
//!
//! Clock compensation assumes the skew between hosts is small and mostly
//! constant: the offset is measured once when a node joins (and again on
//! demand), not tracked continuously.

pub mod client;
pub mod coordinator;
pub mod group;
pub mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::{ClockOffset, SyncClient, SyncDirective, wait_until};
pub use coordinator::{SyncCoordinator, SyncOutput, Target};
pub use group::SyncGroup;
pub use server::SyncServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    None,
    DataSync,
    BarrierSync,
    ClockCompensated,
}

impl SyncMode {
    pub fn is_synchronized(self) -> bool {
        self != SyncMode::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Port the coordinator listens on.
    pub port: u16,
    /// How long the coordinator waits for stragglers before evicting
    /// them. `None` waits forever.
    pub barrier_timeout_ms: Option<u64>,
    /// How long a node waits for a release before giving up on the
    /// frame. `None` waits forever.
    pub node_timeout_ms: Option<u64>,
    /// Lead time added to the coordinator clock for `SwapAt` deadlines.
    pub swap_lead_us: u64,
    /// Interval of the coordinator's timeout sweep.
    pub tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: 12000,
            barrier_timeout_ms: Some(2000),
            node_timeout_ms: Some(5000),
            swap_lead_us: 4000,
            tick_ms: 50,
        }
    }
}

impl SyncConfig {
    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_ms.map(Duration::from_millis)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_to_none() {
        assert_eq!(SyncMode::default(), SyncMode::None);
        assert!(!SyncMode::None.is_synchronized());
        assert!(SyncMode::BarrierSync.is_synchronized());
    }

    #[test]
    fn config_timeouts() {
        let c = SyncConfig {
            barrier_timeout_ms: None,
            ..SyncConfig::default()
        };
        assert_eq!(c.barrier_timeout(), None);
        assert_eq!(c.node_timeout(), Some(Duration::from_secs(5)));
    }
}
