//! Assignment of bridge members to instances.
//!
//! Under [`AllocationPolicy::SingleNode`] one member relays a whole
//! instance. Under [`AllocationPolicy::LoadBalanced`] every member
//! relays a contiguous slice of the block ids and the primary member
//! also owns the rounding remainder.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::block::partition::Route;
use crate::error::WallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    #[default]
    SingleNode,
    LoadBalanced,
}

/// Block ids `start..end` relayed by `node_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub node_id: u32,
    pub start: u32,
    pub end: u32,
}

impl NodeRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Members relaying one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Member that relays control traffic for the instance.
    pub primary: u32,
    /// Ordered by `start`, covering every block id exactly once.
    pub ranges: Vec<NodeRange>,
}

impl Allocation {
    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().map(|r| r.node_id)
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.ranges.iter().any(|r| r.node_id == node_id)
    }

    pub fn range_of(&self, node_id: u32) -> Option<NodeRange> {
        self.ranges.iter().find(|r| r.node_id == node_id).copied()
    }

    /// Route of the blocks `node_id` relays.
    pub fn route_of(&self, node_id: u32) -> Option<Route> {
        self.range_of(node_id).map(|r| Route::Blocks {
            start: r.start,
            end: r.end,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.ranges.iter().map(NodeRange::len).sum()
    }
}

/// What a member is currently carrying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberLoad {
    pub bandwidth_bps: u64,
    pub instances: usize,
    pub primaries: usize,
}

#[derive(Debug)]
struct Hosted {
    allocation: Allocation,
    bandwidth_bps: u64,
}

/// Tracks member load and hands out allocations.
#[derive(Debug)]
pub struct Allocator {
    policy: AllocationPolicy,
    members: Vec<u32>,
    hosted: HashMap<u32, Hosted>,
}

impl Allocator {
    pub fn new(policy: AllocationPolicy, members: impl IntoIterator<Item = u32>) -> Result<Self, WallError> {
        let mut members: Vec<u32> = members.into_iter().collect();
        members.sort_unstable();
        members.dedup();
        if members.is_empty() {
            return Err(WallError::InvalidConfig("bridge has no members".into()));
        }
        Ok(Self {
            policy,
            members,
            hosted: HashMap::new(),
        })
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn allocation(&self, instance: u32) -> Option<&Allocation> {
        self.hosted.get(&instance).map(|h| &h.allocation)
    }

    /// Current load of every member, by id.
    pub fn loads(&self) -> BTreeMap<u32, MemberLoad> {
        let mut loads: BTreeMap<u32, MemberLoad> =
            self.members.iter().map(|&m| (m, MemberLoad::default())).collect();
        for hosted in self.hosted.values() {
            let total = u64::from(hosted.allocation.block_count().max(1));
            for range in &hosted.allocation.ranges {
                let Some(load) = loads.get_mut(&range.node_id) else {
                    continue;
                };
                load.instances += 1;
                load.bandwidth_bps += hosted.bandwidth_bps * u64::from(range.len()) / total;
            }
            if let Some(load) = loads.get_mut(&hosted.allocation.primary) {
                load.primaries += 1;
            }
        }
        loads
    }

    /// Allocate members for an instance of `block_count` blocks.
    pub fn allocate(&mut self, instance: u32, block_count: u32) -> Result<Allocation, WallError> {
        if self.hosted.contains_key(&instance) {
            return Err(WallError::InvalidConfig(format!(
                "instance {instance} is already allocated"
            )));
        }
        let loads = self.loads();
        let allocation = match self.policy {
            AllocationPolicy::SingleNode => {
                let host = least_loaded(&loads, |l| (l.bandwidth_bps, l.instances as u64));
                Allocation {
                    primary: host,
                    ranges: vec![NodeRange {
                        node_id: host,
                        start: 0,
                        end: block_count,
                    }],
                }
            }
            AllocationPolicy::LoadBalanced => {
                let primary = least_loaded(&loads, |l| (l.primaries as u64, l.bandwidth_bps));
                split(&self.members, primary, block_count)
            }
        };
        self.hosted.insert(
            instance,
            Hosted {
                allocation: allocation.clone(),
                bandwidth_bps: 0,
            },
        );
        Ok(allocation)
    }

    pub fn release(&mut self, instance: u32) -> Option<Allocation> {
        self.hosted.remove(&instance).map(|h| h.allocation)
    }

    /// Record the measured bandwidth of an instance.
    pub fn set_bandwidth(&mut self, instance: u32, bandwidth_bps: u64) {
        if let Some(hosted) = self.hosted.get_mut(&instance) {
            hosted.bandwidth_bps = bandwidth_bps;
        }
    }
}

/// Member with the smallest `key`, lowest id on ties.
fn least_loaded<K: Ord>(loads: &BTreeMap<u32, MemberLoad>, key: impl Fn(&MemberLoad) -> K) -> u32 {
    loads
        .iter()
        .min_by_key(|(id, load)| (key(load), **id))
        .map(|(id, _)| *id)
        .unwrap_or_default()
}

/// Contiguous near-equal ranges in member order; the primary's range is
/// widened by the remainder. Members left with nothing are omitted.
fn split(members: &[u32], primary: u32, block_count: u32) -> Allocation {
    let count = members.len() as u32;
    let base = block_count / count;
    let remainder = block_count % count;
    let mut ranges = Vec::with_capacity(members.len());
    let mut start = 0;
    for &node_id in members {
        let len = if node_id == primary { base + remainder } else { base };
        if len > 0 || node_id == primary {
            ranges.push(NodeRange {
                node_id,
                start,
                end: start + len,
            });
        }
        start += len;
    }
    Allocation { primary, ranges }
}
