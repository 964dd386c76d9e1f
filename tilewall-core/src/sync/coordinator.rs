use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::control::message::SyncMessage;
use crate::sync::{SyncConfig, SyncGroup, SyncMode};

/// Where a coordinator message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every member of the group.
    Group(u32),
    Node(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutput {
    pub to: Target,
    pub msg: SyncMessage,
}

impl SyncOutput {
    fn group(group: u32, msg: SyncMessage) -> Self {
        Self {
            to: Target::Group(group),
            msg,
        }
    }

    fn node(node: u32, msg: SyncMessage) -> Self {
        Self {
            to: Target::Node(node),
            msg,
        }
    }
}

/// Transport-free release logic for every sync group.
///
/// Feed it node messages with [`handle`](Self::handle) and call
/// [`tick`](Self::tick) periodically to evict stragglers.
#[derive(Debug)]
pub struct SyncCoordinator {
    config: SyncConfig,
    groups: HashMap<u32, SyncGroup>,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn group(&self, id: u32) -> Option<&SyncGroup> {
        self.groups.get(&id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Groups `node` belongs to.
    pub fn groups_of(&self, node: u32) -> Vec<u32> {
        self.groups
            .values()
            .filter(|g| g.is_member(node))
            .map(|g| g.id())
            .collect()
    }

    pub fn handle(&mut self, msg: SyncMessage, now: Instant, now_us: u64) -> Vec<SyncOutput> {
        let mut out = Vec::new();
        match msg {
            SyncMessage::Join { group, node, mode } => {
                let g = self.groups.entry(group).or_insert_with(|| {
                    info!(group, ?mode, "sync group created");
                    SyncGroup::new(group, mode)
                });
                if g.mode() != mode {
                    warn!(group, node, ?mode, current = ?g.mode(), "join with mismatched mode");
                }
                if g.join(node) {
                    debug!(group, node, members = g.member_count(), "node joined");
                }
            }
            SyncMessage::Leave { group, node } => {
                self.remove_member(group, node, now, now_us, &mut out);
            }
            SyncMessage::Ready { group, node, frame } => {
                let Some(g) = self.groups.get_mut(&group) else {
                    debug!(group, node, "ready for unknown group");
                    return out;
                };
                if !g.mark_ready(node, frame, now) {
                    debug!(group, node, frame, "ready ignored");
                    return out;
                }
                self.evaluate(group, now, now_us, &mut out);
            }
            SyncMessage::BarrierEnter { group, node, frame } => {
                let released = self
                    .groups
                    .get_mut(&group)
                    .and_then(|g| g.enter_barrier(node, frame, now));
                if let Some(frame) = released {
                    out.push(SyncOutput::group(
                        group,
                        SyncMessage::BarrierRelease { group, frame },
                    ));
                    self.evaluate(group, now, now_us, &mut out);
                }
            }
            SyncMessage::ClockProbe { node, sent_us } => {
                out.push(SyncOutput::node(
                    node,
                    SyncMessage::ClockReply {
                        node,
                        sent_us,
                        coordinator_us: now_us,
                    },
                ));
            }
            other => debug!(?other, "coordinator ignores node-bound message"),
        }
        out
    }

    /// Drop `node` from every group, e.g. when its link goes away.
    pub fn forget_node(&mut self, node: u32, now: Instant, now_us: u64) -> Vec<SyncOutput> {
        let mut out = Vec::new();
        for group in self.groups_of(node) {
            self.remove_member(group, node, now, now_us, &mut out);
        }
        out
    }

    /// Evict members that kept a group waiting past the barrier timeout.
    pub fn tick(&mut self, now: Instant, now_us: u64) -> Vec<SyncOutput> {
        let mut out = Vec::new();
        let Some(timeout) = self.config.barrier_timeout() else {
            return out;
        };
        let expired: Vec<u32> = self
            .groups
            .values()
            .filter(|g| g.wait_expired(now, timeout))
            .map(|g| g.id())
            .collect();
        for group in expired {
            let stragglers = self
                .groups
                .get(&group)
                .map(|g| g.stragglers())
                .unwrap_or_default();
            for node in stragglers {
                warn!(group, node, ?timeout, "evicting node after sync timeout");
                out.push(SyncOutput::node(node, SyncMessage::Evicted { group, node }));
                self.remove_member(group, node, now, now_us, &mut out);
            }
        }
        out
    }

    fn remove_member(
        &mut self,
        group: u32,
        node: u32,
        now: Instant,
        now_us: u64,
        out: &mut Vec<SyncOutput>,
    ) {
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        if !g.leave(node) {
            return;
        }
        debug!(group, node, members = g.member_count(), "node left");
        if g.is_empty() {
            info!(group, "sync group dissolved");
            self.groups.remove(&group);
            return;
        }
        if let Some(frame) = g.barrier_complete(now) {
            out.push(SyncOutput::group(
                group,
                SyncMessage::BarrierRelease { group, frame },
            ));
        }
        self.evaluate(group, now, now_us, out);
    }

    fn evaluate(&mut self, group: u32, now: Instant, now_us: u64, out: &mut Vec<SyncOutput>) {
        let lead = self.config.swap_lead_us;
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        while let Some(frame) = g.release_candidate() {
            g.release(frame, now);
            let msg = match g.mode() {
                SyncMode::None | SyncMode::DataSync => SyncMessage::Release { group, frame },
                SyncMode::BarrierSync => SyncMessage::Swap { group, frame },
                SyncMode::ClockCompensated => SyncMessage::SwapAt {
                    group,
                    frame,
                    deadline_us: now_us + lead,
                },
            };
            debug!(group, frame, "frame released");
            out.push(SyncOutput::group(group, msg));
        }
    }
}
