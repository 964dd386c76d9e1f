//! Bridge-side record of one registered producer.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::bridge::alloc::Allocation;
use crate::control::dispatch::PeerId;
use crate::control::message::StreamInfo;
use crate::error::WallError;
use crate::geometry::WindowLayout;
use crate::perf::PerfCounter;
use crate::streamer::config::Destination;

// ── InstancePhase ────────────────────────────────────────────────

/// Lifecycle of an instance on this bridge member.
///
/// ```text
///  Registered ──► Connected ──► Streaming
///       │             │             │
///       └─────────────┴─────────────┴──► TornDown
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstancePhase {
    /// Allocated; no producer data link yet.
    Registered { since: Instant },
    /// Producer data link is up.
    Connected,
    /// At least one share is being relayed.
    Streaming { since: Instant },
    TornDown,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered { .. } => write!(f, "Registered"),
            Self::Connected => write!(f, "Connected"),
            Self::Streaming { .. } => write!(f, "Streaming"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

impl InstancePhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming { .. })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self, Self::TornDown)
    }

    /// Valid from: `Registered`.
    pub fn connect(&mut self) -> Result<(), WallError> {
        match self {
            Self::Registered { .. } => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(WallError::InvalidTransition(
                "cannot connect: not in Registered state",
            )),
        }
    }

    /// Valid from: `Connected`.
    pub fn start_streaming(&mut self) -> Result<(), WallError> {
        match self {
            Self::Connected => {
                *self = Self::Streaming {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(WallError::InvalidTransition(
                "cannot stream: not in Connected state",
            )),
        }
    }

    /// Valid from any phase but `TornDown`.
    pub fn tear_down(&mut self) -> Result<(), WallError> {
        match self {
            Self::TornDown => Err(WallError::InvalidTransition(
                "cannot tear down: already torn down",
            )),
            _ => {
                *self = Self::TornDown;
                Ok(())
            }
        }
    }
}

// ── Share ────────────────────────────────────────────────────────

/// One logical destination set of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub destinations: Vec<Destination>,
    pub sync_group: Option<u32>,
    /// Relay links to the destinations are open.
    pub active: bool,
}

impl Share {
    pub fn nodes(&self) -> BTreeSet<u32> {
        self.destinations.iter().map(|d| d.node_id).collect()
    }
}

// ── AppInstance ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct AppInstance {
    pub id: u32,
    pub app_name: String,
    pub stream: StreamInfo,
    pub layout: WindowLayout,
    pub audio: bool,
    /// Control link of the registering producer, if it is ours.
    pub producer: Option<PeerId>,
    allocation: Option<Allocation>,
    phase: InstancePhase,
    shares: Vec<Share>,
    ready: BTreeSet<u32>,
    registered_at: Instant,
    pub perf: PerfCounter,
    /// Peer asking for periodic reports and the interval.
    pub perf_subscriber: Option<(PeerId, Duration, Instant)>,
}

impl AppInstance {
    pub fn new(id: u32, app_name: String, stream: StreamInfo, layout: WindowLayout, audio: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            app_name,
            stream,
            layout,
            audio,
            producer: None,
            allocation: None,
            phase: InstancePhase::Registered { since: now },
            shares: Vec::new(),
            ready: BTreeSet::new(),
            registered_at: now,
            perf: PerfCounter::starting_at(now),
            perf_subscriber: None,
        }
    }

    pub fn phase(&self) -> &InstancePhase {
        &self.phase
    }

    pub fn phase_mut(&mut self) -> &mut InstancePhase {
        &mut self.phase
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Fix the allocation. Only possible before the producer connects,
    /// and only once.
    pub fn set_allocation(&mut self, allocation: Allocation) -> Result<(), WallError> {
        if self.allocation.is_some() || self.phase.is_connected() {
            return Err(WallError::InvalidTransition(
                "cannot reallocate: streaming links are established",
            ));
        }
        self.allocation = Some(allocation);
        Ok(())
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn add_share(&mut self, destinations: Vec<Destination>, sync_group: Option<u32>) -> usize {
        self.shares.push(Share {
            destinations,
            sync_group,
            active: false,
        });
        self.shares.len() - 1
    }

    pub fn mark_ready(&mut self, node_id: u32) {
        self.ready.insert(node_id);
    }

    pub fn is_ready(&self, node_id: u32) -> bool {
        self.ready.contains(&node_id)
    }

    /// Inactive shares whose nodes have all reported ready.
    pub fn startable_shares(&self) -> Vec<usize> {
        self.shares
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.active && s.nodes().iter().all(|n| self.ready.contains(n)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn activate_share(&mut self, index: usize) -> Option<&Share> {
        let share = self.shares.get_mut(index)?;
        share.active = true;
        Some(share)
    }

    /// Some share has every node ready.
    pub fn any_share_ready(&self) -> bool {
        self.shares
            .iter()
            .any(|s| s.nodes().iter().all(|n| self.ready.contains(n)))
    }

    /// Account for one frame relayed by `member`. Its allocated range
    /// is what should have come through.
    pub fn record_relayed(&mut self, member: u32, bytes: u64, blocks: u64) {
        let expected = self
            .allocation
            .as_ref()
            .and_then(|a| a.range_of(member))
            .map_or(blocks, |r| u64::from(r.len()));
        self.perf.add_bytes(bytes);
        self.perf.add_frame(expected, blocks);
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.registered_at)
    }

    /// No share became ready within `timeout`. `None` waits forever.
    pub fn ready_expired(&self, now: Instant, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => !self.any_share_ready() && self.waited(now) >= limit,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::partition::Route;
    use crate::block::types::PixelFormat;
    use crate::bridge::alloc::NodeRange;
    use crate::geometry::Rect;
    use crate::sync::SyncMode;

    fn instance() -> AppInstance {
        let stream = StreamInfo {
            image_width: 64,
            image_height: 64,
            block_width: 32,
            block_height: 32,
            format: PixelFormat::Rgb8,
            blocks_per_group: 2,
            sync_mode: SyncMode::DataSync,
            frame_rate: 0,
        };
        let layout = WindowLayout::new(Rect::new(0, 0, 64, 64), Default::default());
        AppInstance::new(1, "viewer".into(), stream, layout, false)
    }

    fn dest(node_id: u32) -> Destination {
        Destination {
            node_id,
            host: "127.0.0.1".into(),
            port: 9000,
            route: Route::Blocks { start: 0, end: 4 },
        }
    }

    fn alloc() -> Allocation {
        Allocation {
            primary: 1,
            ranges: vec![NodeRange { node_id: 1, start: 0, end: 4 }],
        }
    }

    #[test]
    fn phase_follows_the_lifecycle() {
        let mut phase = InstancePhase::Registered {
            since: Instant::now(),
        };
        assert!(phase.start_streaming().is_err());
        phase.connect().unwrap();
        assert!(phase.connect().is_err());
        phase.start_streaming().unwrap();
        assert!(phase.is_streaming());
        assert_eq!(phase.to_string(), "Streaming");
        phase.tear_down().unwrap();
        assert!(matches!(phase.tear_down(), Err(WallError::InvalidTransition(_))));
    }

    #[test]
    fn allocation_is_frozen_once_connected() {
        let mut inst = instance();
        inst.phase_mut().connect().unwrap();
        assert!(inst.set_allocation(alloc()).is_err());

        let mut inst = instance();
        inst.set_allocation(alloc()).unwrap();
        assert!(inst.set_allocation(alloc()).is_err());
    }

    #[test]
    fn shares_start_when_all_nodes_are_ready() {
        let mut inst = instance();
        inst.add_share(vec![dest(4), dest(5)], Some(9));
        inst.mark_ready(4);
        assert!(inst.startable_shares().is_empty());
        inst.mark_ready(5);
        assert_eq!(inst.startable_shares(), vec![0]);
        assert_eq!(inst.activate_share(0).unwrap().sync_group, Some(9));
        assert!(inst.startable_shares().is_empty());
    }

    #[test]
    fn relayed_frames_count_against_the_member_range() {
        let mut inst = instance();
        inst.set_allocation(alloc()).unwrap();
        inst.record_relayed(1, 4096, 4);
        inst.record_relayed(1, 2048, 2);
        assert_eq!(inst.perf.total_bytes(), 6144);
        let report = inst.perf.report();
        assert_eq!(report.frames, 2);
        assert!((report.loss_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn readiness_deadline() {
        let mut inst = instance();
        inst.add_share(vec![dest(4)], None);
        let later = Instant::now() + Duration::from_secs(5);
        assert!(!inst.ready_expired(later, None));
        assert!(inst.ready_expired(later, Some(Duration::from_secs(1))));
        inst.mark_ready(4);
        assert!(!inst.ready_expired(later, Some(Duration::from_secs(1))));
    }
}
