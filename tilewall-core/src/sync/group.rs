use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::sync::SyncMode;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for every member to report ready.
    Collecting,
    /// Swap sent; waiting for every member to enter the barrier.
    Barrier { frame: u32, entered: BTreeSet<u32> },
}

/// Readiness bookkeeping for the members that swap together.
#[derive(Debug, Clone)]
pub struct SyncGroup {
    id: u32,
    mode: SyncMode,
    members: BTreeSet<u32>,
    /// Latest frame each member reported ready.
    ready: BTreeMap<u32, u32>,
    released: Option<u32>,
    phase: Phase,
    /// Start of the current wait, for straggler eviction.
    waiting_since: Option<Instant>,
}

impl SyncGroup {
    pub fn new(id: u32, mode: SyncMode) -> Self {
        Self {
            id,
            mode,
            members: BTreeSet::new(),
            ready: BTreeMap::new(),
            released: None,
            phase: Phase::Collecting,
            waiting_since: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn members(&self) -> impl Iterator<Item = u32> + '_ {
        self.members.iter().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, node: u32) -> bool {
        self.members.contains(&node)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Last frame released to the group.
    pub fn released_frame(&self) -> Option<u32> {
        self.released
    }

    pub fn in_barrier(&self) -> bool {
        matches!(self.phase, Phase::Barrier { .. })
    }

    pub fn join(&mut self, node: u32) -> bool {
        self.members.insert(node)
    }

    /// Remove `node`; its pending reports go with it.
    pub fn leave(&mut self, node: u32) -> bool {
        self.ready.remove(&node);
        if let Phase::Barrier { entered, .. } = &mut self.phase {
            entered.remove(&node);
        }
        self.members.remove(&node)
    }

    fn is_fresh(&self, frame: u32) -> bool {
        self.released.is_none_or(|r| frame > r)
    }

    /// Record a ready report. Stale frames and non-members are ignored.
    pub fn mark_ready(&mut self, node: u32, frame: u32, now: Instant) -> bool {
        if !self.members.contains(&node) || !self.is_fresh(frame) {
            return false;
        }
        let slot = self.ready.entry(node).or_insert(frame);
        *slot = (*slot).max(frame);
        if self.waiting_since.is_none() {
            self.waiting_since = Some(now);
        }
        true
    }

    /// Frame every member is ready for, if any.
    pub fn release_candidate(&self) -> Option<u32> {
        if self.members.is_empty() || self.in_barrier() {
            return None;
        }
        let mut min = u32::MAX;
        for node in &self.members {
            let frame = *self.ready.get(node)?;
            if !self.is_fresh(frame) {
                return None;
            }
            min = min.min(frame);
        }
        Some(min)
    }

    /// Commit a release of `frame`. Barrier mode moves to the barrier
    /// phase.
    pub fn release(&mut self, frame: u32, now: Instant) {
        self.released = Some(frame);
        self.ready.retain(|_, f| *f > frame);
        if self.mode == SyncMode::BarrierSync {
            self.phase = Phase::Barrier {
                frame,
                entered: BTreeSet::new(),
            };
            self.waiting_since = Some(now);
        } else {
            self.waiting_since = if self.ready.is_empty() { None } else { Some(now) };
        }
    }

    /// Record a barrier entry. Returns the frame once every member has
    /// entered.
    pub fn enter_barrier(&mut self, node: u32, frame: u32, now: Instant) -> Option<u32> {
        let Phase::Barrier {
            frame: current,
            entered,
        } = &mut self.phase
        else {
            return None;
        };
        if frame != *current || !self.members.contains(&node) {
            return None;
        }
        entered.insert(node);
        self.barrier_complete(now)
    }

    /// Close the barrier if every remaining member has entered.
    pub fn barrier_complete(&mut self, now: Instant) -> Option<u32> {
        let Phase::Barrier { frame, entered } = &self.phase else {
            return None;
        };
        if !self.members.iter().all(|m| entered.contains(m)) {
            return None;
        }
        let frame = *frame;
        self.phase = Phase::Collecting;
        self.waiting_since = if self.ready.is_empty() { None } else { Some(now) };
        Some(frame)
    }

    /// Members holding up the current wait.
    pub fn stragglers(&self) -> Vec<u32> {
        match &self.phase {
            Phase::Collecting => self
                .members
                .iter()
                .filter(|m| !self.ready.get(m).is_some_and(|f| self.is_fresh(*f)))
                .copied()
                .collect(),
            Phase::Barrier { entered, .. } => self
                .members
                .iter()
                .filter(|m| !entered.contains(m))
                .copied()
                .collect(),
        }
    }

    /// Whether the current wait has run past `timeout`.
    pub fn wait_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.waiting_since
            .is_some_and(|since| now.duration_since(since) >= timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(mode: SyncMode, members: &[u32]) -> SyncGroup {
        let mut g = SyncGroup::new(1, mode);
        for m in members {
            g.join(*m);
        }
        g
    }

    #[test]
    fn release_needs_every_member() {
        let now = Instant::now();
        let mut g = group(SyncMode::DataSync, &[1, 2, 3]);
        g.mark_ready(1, 1, now);
        g.mark_ready(2, 1, now);
        assert_eq!(g.release_candidate(), None);
        assert_eq!(g.stragglers(), vec![3]);
        g.mark_ready(3, 1, now);
        assert_eq!(g.release_candidate(), Some(1));
        g.release(1, now);
        assert_eq!(g.released_frame(), Some(1));
        assert_eq!(g.release_candidate(), None);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let now = Instant::now();
        let mut g = group(SyncMode::DataSync, &[1]);
        g.mark_ready(1, 5, now);
        g.release(5, now);
        assert!(!g.mark_ready(1, 5, now));
        assert!(!g.mark_ready(9, 6, now), "non-member");
    }

    #[test]
    fn barrier_waits_for_all_entries() {
        let now = Instant::now();
        let mut g = group(SyncMode::BarrierSync, &[1, 2]);
        g.mark_ready(1, 1, now);
        g.mark_ready(2, 1, now);
        g.release(1, now);
        assert!(g.in_barrier());
        assert_eq!(g.enter_barrier(1, 1, now), None);
        assert_eq!(g.enter_barrier(2, 0, now), None, "wrong frame");
        assert_eq!(g.enter_barrier(2, 1, now), Some(1));
        assert!(!g.in_barrier());
    }

    #[test]
    fn leaving_unblocks_the_rest() {
        let now = Instant::now();
        let mut g = group(SyncMode::DataSync, &[1, 2]);
        g.mark_ready(1, 3, now);
        assert_eq!(g.release_candidate(), None);
        g.leave(2);
        assert_eq!(g.release_candidate(), Some(3));
    }

    #[test]
    fn wait_expiry() {
        let t0 = Instant::now();
        let mut g = group(SyncMode::DataSync, &[1, 2]);
        assert!(!g.wait_expired(t0 + Duration::from_secs(10), Duration::from_secs(1)));
        g.mark_ready(1, 1, t0);
        assert!(!g.wait_expired(t0, Duration::from_secs(1)));
        assert!(g.wait_expired(t0 + Duration::from_secs(1), Duration::from_secs(1)));
    }
}
