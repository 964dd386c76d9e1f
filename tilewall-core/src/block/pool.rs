//! Bounded pool of reusable block groups.
//!
//! A group cycles pool → in-flight → returned. Acquiring from an empty
//! sub-pool waits until another task releases a group; this is the
//! engine's backpressure, not an error.
//!
//! Fan-out: [`BlockPool::share`] turns one group into several
//! [`SharedGroup`] handles. Each handle gives read access; dropping the
//! last one moves the group from the vacant set back to the data pool.
//! Counter updates only happen under the pool lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::block::group::{BlockGroup, GroupSpec};
use crate::error::WallError;

bitflags! {
    /// Construction options for a [`BlockPool`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolOptions: u8 {
        /// Keep a control sub-pool next to the data sub-pool.
        const CTRL_GROUP = 0x01;
        /// Allow fan-out through `share`.
        const MULTI_READER = 0x02;
    }
}

/// Which sub-pool to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Data,
    Control,
}

struct VacantEntry {
    group: Arc<BlockGroup>,
    readers: usize,
}

struct PoolState {
    data: Vec<BlockGroup>,
    control: Vec<BlockGroup>,
    vacant: HashMap<u64, VacantEntry>,
}

struct PoolInner {
    spec: GroupSpec,
    options: PoolOptions,
    data_capacity: usize,
    control_capacity: usize,
    state: Mutex<PoolState>,
    data_ready: Notify,
    control_ready: Notify,
}

/// Cheaply cloneable handle to a shared pool.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("spec", &self.inner.spec)
            .field("data_capacity", &self.inner.data_capacity)
            .field("available", &self.available(GroupKind::Data))
            .finish()
    }
}

impl BlockPool {
    /// Build a pool holding `groups` data groups (and as many control
    /// groups when `CTRL_GROUP` is set).
    pub fn new(spec: GroupSpec, groups: usize, options: PoolOptions) -> Result<Self, WallError> {
        if groups == 0 || spec.blocks_per_group == 0 || spec.block_size() == 0 {
            return Err(WallError::InvalidConfig(format!(
                "block pool needs groups > 0 and non-empty blocks (groups={groups}, spec={spec:?})"
            )));
        }
        let data = (0..groups).map(|_| BlockGroup::data(&spec)).collect();
        let control_capacity = if options.contains(PoolOptions::CTRL_GROUP) {
            groups
        } else {
            0
        };
        let control = (0..control_capacity)
            .map(|_| BlockGroup::control(&spec))
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                spec,
                options,
                data_capacity: groups,
                control_capacity,
                state: Mutex::new(PoolState {
                    data,
                    control,
                    vacant: HashMap::new(),
                }),
                data_ready: Notify::new(),
                control_ready: Notify::new(),
            }),
        })
    }

    /// Size a pool to hold `bytes` worth of full groups (at least one).
    pub fn with_buffer_bytes(
        spec: GroupSpec,
        bytes: usize,
        options: PoolOptions,
    ) -> Result<Self, WallError> {
        let per_group = spec.blocks_per_group * spec.block_size();
        let groups = if per_group == 0 { 0 } else { (bytes / per_group).max(1) };
        Self::new(spec, groups, options)
    }

    pub fn spec(&self) -> &GroupSpec {
        &self.inner.spec
    }

    pub fn capacity(&self, kind: GroupKind) -> usize {
        match kind {
            GroupKind::Data => self.inner.data_capacity,
            GroupKind::Control => self.inner.control_capacity,
        }
    }

    /// Groups currently sitting in the sub-pool.
    pub fn available(&self, kind: GroupKind) -> usize {
        let state = self.lock();
        match kind {
            GroupKind::Data => state.data.len(),
            GroupKind::Control => state.control.len(),
        }
    }

    /// Groups waiting for outstanding fan-out readers.
    pub fn vacant(&self) -> usize {
        self.lock().vacant.len()
    }

    /// Take a group without waiting.
    pub fn try_acquire(&self, kind: GroupKind) -> Option<BlockGroup> {
        let mut state = self.lock();
        match kind {
            GroupKind::Data => state.data.pop(),
            GroupKind::Control => state.control.pop(),
        }
    }

    /// Take a group, waiting while the sub-pool is empty.
    pub async fn acquire(&self, kind: GroupKind) -> Result<BlockGroup, WallError> {
        if kind == GroupKind::Control && self.inner.control_capacity == 0 {
            return Err(WallError::InvalidConfig(
                "control sub-pool is disabled".into(),
            ));
        }
        let notify = match kind {
            GroupKind::Data => &self.inner.data_ready,
            GroupKind::Control => &self.inner.control_ready,
        };
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(group) = self.try_acquire(kind) {
                return Ok(group);
            }
            trace!(?kind, "block pool exhausted, waiting");
            notified.await;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up when `cancel` fires.
    pub async fn acquire_or_cancel(
        &self,
        kind: GroupKind,
        cancel: &CancellationToken,
    ) -> Result<BlockGroup, WallError> {
        tokio::select! {
            group = self.acquire(kind) => group,
            _ = cancel.cancelled() => Err(WallError::Cancelled),
        }
    }

    /// Return a group to the sub-pool it belongs to.
    pub fn release(&self, mut group: BlockGroup) {
        group.reset();
        let data = group.is_data_group();
        {
            let mut state = self.lock();
            if data {
                state.data.push(group);
            } else {
                state.control.push(group);
            }
        }
        if data {
            self.inner.data_ready.notify_one();
        } else {
            self.inner.control_ready.notify_one();
        }
    }

    /// Hand one group to `readers` concurrent readers. The group comes
    /// back to the data pool once every handle is dropped.
    pub fn share(&self, group: BlockGroup, readers: usize) -> Result<Vec<SharedGroup>, WallError> {
        if !self.inner.options.contains(PoolOptions::MULTI_READER) {
            return Err(WallError::InvalidConfig(
                "pool was built without MULTI_READER".into(),
            ));
        }
        if readers == 0 {
            self.release(group);
            return Ok(Vec::new());
        }
        let uid = group.uid();
        let group = Arc::new(group);
        {
            let mut state = self.lock();
            state.vacant.insert(
                uid,
                VacantEntry {
                    group: Arc::clone(&group),
                    readers,
                },
            );
        }
        Ok((0..readers)
            .map(|_| SharedGroup {
                uid,
                group: Some(Arc::clone(&group)),
                pool: self.clone(),
            })
            .collect())
    }

    fn dereference(&self, uid: u64, handle: Arc<BlockGroup>) {
        let recovered = {
            let mut state = self.lock();
            drop(handle);
            let remaining = match state.vacant.get_mut(&uid) {
                Some(entry) => {
                    entry.readers -= 1;
                    entry.readers
                }
                None => {
                    warn!(uid, "dereference of a group that is not vacant");
                    return;
                }
            };
            if remaining > 0 {
                return;
            }
            let Some(entry) = state.vacant.remove(&uid) else {
                return;
            };
            match Arc::try_unwrap(entry.group) {
                Ok(group) => group,
                Err(_) => {
                    warn!(uid, "shared group still referenced at count zero");
                    return;
                }
            }
        };
        self.release(recovered);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves only plain Vec/HashMap
        // state behind, which stays consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── SharedGroup ──────────────────────────────────────────────────

/// Read handle to a fanned-out group.
pub struct SharedGroup {
    uid: u64,
    group: Option<Arc<BlockGroup>>,
    pool: BlockPool,
}

impl SharedGroup {
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl std::ops::Deref for SharedGroup {
    type Target = BlockGroup;

    fn deref(&self) -> &BlockGroup {
        self.group
            .as_deref()
            .expect("shared group accessed after release")
    }
}

impl std::fmt::Debug for SharedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGroup").field("uid", &self.uid).finish()
    }
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            self.pool.dereference(self.uid, group);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::block::header::GroupFlag;
    use crate::block::types::PixelFormat;

    fn spec() -> GroupSpec {
        GroupSpec {
            block_width: 8,
            block_height: 8,
            format: PixelFormat::Luminance8,
            blocks_per_group: 2,
        }
    }

    fn pool(groups: usize) -> BlockPool {
        BlockPool::new(
            spec(),
            groups,
            PoolOptions::CTRL_GROUP | PoolOptions::MULTI_READER,
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(BlockPool::new(spec(), 0, PoolOptions::empty()).is_err());
    }

    #[test]
    fn sizing_from_bytes() {
        let p = BlockPool::with_buffer_bytes(spec(), 64 * 2 * 5, PoolOptions::empty()).unwrap();
        assert_eq!(p.capacity(GroupKind::Data), 5);
        assert_eq!(p.capacity(GroupKind::Control), 0);
    }

    #[tokio::test]
    async fn acquire_and_release_cycle() {
        let p = pool(2);
        let a = p.acquire(GroupKind::Data).await.unwrap();
        let _b = p.acquire(GroupKind::Data).await.unwrap();
        assert_eq!(p.available(GroupKind::Data), 0);
        assert!(p.try_acquire(GroupKind::Data).is_none());
        p.release(a);
        assert_eq!(p.available(GroupKind::Data), 1);
    }

    #[tokio::test]
    async fn control_groups_return_to_control_pool() {
        let p = pool(1);
        let mut c = p.acquire(GroupKind::Control).await.unwrap();
        c.seal_control(GroupFlag::EndFrame, 1, 0);
        p.release(c);
        assert_eq!(p.available(GroupKind::Control), 1);
        assert_eq!(p.available(GroupKind::Data), 1);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let p = pool(1);
        let held = p.acquire(GroupKind::Data).await.unwrap();

        let waiter = tokio::spawn({
            let p = p.clone();
            async move { p.acquire(GroupKind::Data).await.unwrap().uid() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let uid = held.uid();
        p.release(held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
        assert_eq!(got, uid);
    }

    #[tokio::test]
    async fn acquire_or_cancel_stops_waiting() {
        let p = pool(1);
        let _held = p.acquire(GroupKind::Data).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = p.acquire_or_cancel(GroupKind::Data, &cancel).await;
        assert!(matches!(res, Err(WallError::Cancelled)));
    }

    #[tokio::test]
    async fn shared_group_returns_after_last_reader() {
        let p = pool(1);
        let g = p.acquire(GroupKind::Data).await.unwrap();
        let mut handles = p.share(g, 3).unwrap();
        assert_eq!(p.vacant(), 1);

        handles.pop();
        handles.pop();
        assert_eq!(p.available(GroupKind::Data), 0, "still referenced");
        assert_eq!(p.vacant(), 1);

        handles.pop();
        assert_eq!(p.available(GroupKind::Data), 1);
        assert_eq!(p.vacant(), 0);
    }

    #[tokio::test]
    async fn share_requires_multi_reader() {
        let p = BlockPool::new(spec(), 1, PoolOptions::empty()).unwrap();
        let g = p.acquire(GroupKind::Data).await.unwrap();
        assert!(p.share(g, 2).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_no_group_is_held_twice() {
        const GROUPS: usize = 4;
        const PRODUCERS: usize = 6;
        const CONSUMERS: usize = 3;
        const ROUNDS: usize = 200;

        let p = pool(GROUPS);
        let in_use: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
        let consumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::mpsc::channel::<(usize, BlockGroup)>(GROUPS);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut producers = Vec::new();
        for id in 0..PRODUCERS {
            let p = p.clone();
            let tx = tx.clone();
            let in_use = Arc::clone(&in_use);
            producers.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let mut g = p.acquire(GroupKind::Data).await.unwrap();
                    assert!(in_use.lock().unwrap().insert(g.uid()), "group handed out twice");
                    let block = g.next_block_mut().unwrap();
                    block.data_mut().fill(id as u8);
                    tokio::task::yield_now().await;
                    assert!(g.blocks()[0].data().iter().all(|&b| b == id as u8));
                    tx.send((id, g)).await.unwrap();
                }
            }));
        }
        drop(tx);

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let p = p.clone();
            let rx = Arc::clone(&rx);
            let in_use = Arc::clone(&in_use);
            let consumed = Arc::clone(&consumed);
            consumers.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((id, g)) = next else { break };
                    assert!(g.blocks()[0].data().iter().all(|&b| b == id as u8));
                    assert!(in_use.lock().unwrap().remove(&g.uid()));
                    consumed.fetch_add(1, Ordering::Relaxed);
                    p.release(g);
                }
            }));
        }

        for h in producers {
            h.await.unwrap();
        }
        for h in consumers {
            h.await.unwrap();
        }
        assert_eq!(consumed.load(Ordering::Relaxed), PRODUCERS * ROUNDS);
        assert_eq!(p.available(GroupKind::Data), GROUPS);
    }
}
