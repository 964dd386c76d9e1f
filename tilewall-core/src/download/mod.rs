//! Per-instance reassembly of pixel groups into montages.
//!
//! ```text
//!            CONFIG_UPDATE (layout known)
//! WaitConfig ───────────────────────────▶ WaitData
//!                                          │   ▲
//!                 frame complete (sync on) │   │ release
//!                                          ▼   │
//!                                        WaitSync
//! ```
//!
//! A [`Downloader`] is fed groups from one or more sources (connections)
//! and never touches the network itself. Groups it cannot use yet are
//! held and replayed once the missing layout or release arrives; every
//! other group goes straight back to the pool.

pub mod montage;
pub mod table;

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, info, trace};

use crate::block::group::BlockGroup;
use crate::block::header::GroupFlag;
use crate::block::partition::{BlockPartition, Route};
use crate::block::pool::BlockPool;
use crate::control::message::{StreamInfo, StreamInit};
use crate::error::WallError;
use crate::geometry::{Rect, WindowLayout};
use crate::perf::{PerfCounter, PerfReport};
use crate::sync::SyncMode;
use crate::transport::ConnId;

pub use montage::{Montage, MontagePair};
pub use table::{Placement, TileTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    WaitConfig,
    WaitData,
    WaitSync,
}

/// Something the owner of a downloader has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    /// A frame is complete and waits for release; report it ready.
    FrameReady(u32),
    /// The front montages now show `frame`.
    Swapped(u32),
    /// A new layout is in place.
    Reconfigured { config_id: u32 },
    /// The window has no area; montages were dropped.
    Cleared,
}

#[derive(Debug)]
struct Source {
    route: Route,
    /// Block id at each wire ordinal.
    ordinals: Vec<u32>,
    next_ordinal: u32,
    /// END_FRAME seen for the frame being assembled.
    done: bool,
}

pub struct Downloader {
    instance: u32,
    info: StreamInfo,
    partition: BlockPartition,
    tiles: Vec<Rect>,
    sync_mode: SyncMode,
    state: DownloadState,
    /// State to return to once the awaited layout arrives.
    resume: DownloadState,

    layout: WindowLayout,
    config_id: Option<u32>,
    awaited_config: Option<u32>,
    pending_configs: BTreeMap<u32, WindowLayout>,
    table: TileTable,
    montages: MontagePair,
    sources: HashMap<ConnId, Source>,

    /// Frame being assembled.
    cur_frame: u32,
    /// Last completed frame.
    updated_frame: u32,
    /// Last frame released by the sync group.
    sync_frame: u32,
    /// Frame shown by the front montages.
    displayed_frame: u32,
    received: usize,
    dirty: bool,

    held: VecDeque<(ConnId, BlockGroup)>,
    pool: BlockPool,
    depth: f32,
    perf: PerfCounter,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("instance", &self.instance)
            .field("state", &self.state)
            .field("config_id", &self.config_id)
            .field("cur_frame", &self.cur_frame)
            .field("updated_frame", &self.updated_frame)
            .field("sync_frame", &self.sync_frame)
            .field("held", &self.held.len())
            .finish()
    }
}

impl Downloader {
    pub fn new(init: &StreamInit, pool: BlockPool) -> Result<Self, WallError> {
        let partition = init.stream.partition()?;
        Ok(Self {
            instance: init.instance,
            info: init.stream,
            partition,
            tiles: init.tiles.clone(),
            sync_mode: init.stream.sync_mode,
            state: DownloadState::WaitConfig,
            resume: DownloadState::WaitData,
            layout: WindowLayout::default(),
            config_id: None,
            awaited_config: None,
            pending_configs: BTreeMap::new(),
            table: TileTable::default(),
            montages: MontagePair::new(),
            sources: HashMap::new(),
            cur_frame: 0,
            updated_frame: 0,
            sync_frame: 0,
            displayed_frame: 0,
            received: 0,
            dirty: false,
            held: VecDeque::new(),
            pool,
            depth: 0.0,
            perf: PerfCounter::new(),
        })
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync_mode.is_synchronized()
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    pub fn config_id(&self) -> Option<u32> {
        self.config_id
    }

    pub fn table(&self) -> &TileTable {
        &self.table
    }

    pub fn cur_frame(&self) -> u32 {
        self.cur_frame
    }

    pub fn updated_frame(&self) -> u32 {
        self.updated_frame
    }

    pub fn sync_frame(&self) -> u32 {
        self.sync_frame
    }

    pub fn displayed_frame(&self) -> u32 {
        self.displayed_frame
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn front(&self) -> &[Option<Montage>] {
        self.montages.front()
    }

    /// Whether the front changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn depth(&self) -> f32 {
        self.depth
    }

    pub fn set_depth(&mut self, depth: f32) {
        self.depth = depth;
    }

    pub fn perf_report(&mut self) -> PerfReport {
        self.perf.report()
    }

    /// Expected blocks per frame across all sources.
    pub fn expected_blocks(&self) -> usize {
        self.sources.values().map(|s| s.ordinals.len()).sum()
    }

    // ── Sources ──────────────────────────────────────────────────

    /// Start accepting groups from `conn`, which sends the blocks
    /// `route` selects.
    pub fn add_source(&mut self, conn: ConnId, route: Route) {
        let ordinals = if self.config_id.is_some() {
            self.partition.route_table(&self.layout, &route)
        } else {
            Vec::new()
        };
        debug!(instance = self.instance, conn, blocks = ordinals.len(), "source added");
        self.sources.insert(
            conn,
            Source {
                route,
                ordinals,
                next_ordinal: 0,
                done: false,
            },
        );
    }

    /// Forget `conn`; held groups from it go back to the pool.
    pub fn remove_source(&mut self, conn: ConnId) -> bool {
        let held = std::mem::take(&mut self.held);
        for (from, group) in held {
            if from == conn {
                self.pool.release(group);
            } else {
                self.held.push_back((from, group));
            }
        }
        self.sources.remove(&conn).is_some()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    // ── Configuration ────────────────────────────────────────────

    /// Queue the layout that takes effect when `config_id` arrives in
    /// the pixel stream.
    pub fn enqueue_config(
        &mut self,
        config_id: u32,
        layout: WindowLayout,
    ) -> Result<Vec<DownloadEvent>, WallError> {
        let mut events = Vec::new();
        if self.config_id.is_some_and(|c| config_id <= c) {
            debug!(instance = self.instance, config_id, "stale layout ignored");
            return Ok(events);
        }
        self.pending_configs.insert(config_id, layout);
        let awaited = match self.awaited_config {
            Some(id) => id == config_id,
            // Joined mid-stream: the data already carries this config.
            None => self.held.iter().any(|(_, g)| g.config_id() == config_id),
        };
        if self.state == DownloadState::WaitConfig && awaited {
            self.adopt_config(config_id, &mut events)?;
        }
        Ok(events)
    }

    /// Apply a pending layout and leave `WaitConfig` if it was awaited.
    fn adopt_config(&mut self, config_id: u32, events: &mut Vec<DownloadEvent>) -> Result<(), WallError> {
        self.apply_config(config_id, events);
        if self.state == DownloadState::WaitConfig {
            self.awaited_config = None;
            self.state = self.resume;
            self.replay(events)?;
        }
        Ok(())
    }

    /// A data or end group stamped with a layout we hold but whose
    /// CONFIG_UPDATE never reached us.
    fn implied_config(&self, group: &BlockGroup) -> Option<u32> {
        let config_id = group.config_id();
        let newer = self.config_id.is_none_or(|c| config_id > c);
        (self.awaited_config.is_none() && newer && self.pending_configs.contains_key(&config_id))
            .then_some(config_id)
    }

    fn apply_config(&mut self, config_id: u32, events: &mut Vec<DownloadEvent>) {
        let Some(layout) = self.pending_configs.remove(&config_id) else {
            return;
        };
        self.pending_configs.retain(|id, _| *id > config_id);
        self.layout = layout;
        self.config_id = Some(config_id);
        self.table = TileTable::build(&self.partition, &layout, &self.tiles);
        for source in self.sources.values_mut() {
            source.ordinals = self.partition.route_table(&layout, &source.route);
        }
        if layout.is_hidden() {
            self.montages.clear();
            self.dirty = true;
            info!(instance = self.instance, config_id, "window hidden, montages cleared");
            events.push(DownloadEvent::Cleared);
        } else {
            self.montages.renew(self.table.regions(), self.info.format);
            info!(
                instance = self.instance,
                config_id,
                blocks = self.table.block_count(),
                "layout applied"
            );
        }
        events.push(DownloadEvent::Reconfigured { config_id });
    }

    // ── Groups ───────────────────────────────────────────────────

    /// Consume one classified group from `conn`.
    pub fn process_group(
        &mut self,
        conn: ConnId,
        group: BlockGroup,
    ) -> Result<Vec<DownloadEvent>, WallError> {
        let mut events = Vec::new();
        self.handle(conn, group, &mut events)?;
        Ok(events)
    }

    fn handle(
        &mut self,
        conn: ConnId,
        group: BlockGroup,
        events: &mut Vec<DownloadEvent>,
    ) -> Result<(), WallError> {
        if !self.sources.contains_key(&conn) {
            self.pool.release(group);
            return Err(WallError::UnknownConnection(conn));
        }
        if group.flag() != GroupFlag::ConfigUpdate
            && let Some(config_id) = self.implied_config(&group)
        {
            debug!(instance = self.instance, config_id, "layout taken from group stamp");
            self.adopt_config(config_id, events)?;
        }
        match group.flag() {
            GroupFlag::ConfigUpdate => self.on_config_group(group, events),
            _ if self.state == DownloadState::WaitConfig => {
                trace!(instance = self.instance, frame = group.frame_id(), "held for layout");
                self.held.push_back((conn, group));
                Ok(())
            }
            GroupFlag::PixelData => self.on_data_group(conn, group, events),
            GroupFlag::EndFrame => self.on_end_frame(conn, group, events),
        }
    }

    fn on_config_group(
        &mut self,
        group: BlockGroup,
        events: &mut Vec<DownloadEvent>,
    ) -> Result<(), WallError> {
        let config_id = group.config_id();
        self.pool.release(group);
        if self.config_id.is_some_and(|c| config_id <= c) {
            return Ok(());
        }
        if self.pending_configs.contains_key(&config_id) {
            return self.adopt_config(config_id, events);
        }
        if self.state != DownloadState::WaitConfig {
            self.resume = self.state;
        }
        debug!(instance = self.instance, config_id, "waiting for layout");
        self.state = DownloadState::WaitConfig;
        self.awaited_config = Some(config_id);
        Ok(())
    }

    /// Whether a group for `frame` must wait for a release first: the
    /// back montages still hold a completed frame nobody released.
    /// Frame ids may skip (late join), so this never counts ids.
    fn must_hold(&self, frame: u32) -> bool {
        self.is_synchronized() && self.updated_frame > self.sync_frame && frame > self.updated_frame
    }

    fn start_frame(&mut self, frame: u32) {
        if self.cur_frame > self.updated_frame {
            debug!(
                instance = self.instance,
                frame = self.cur_frame,
                received = self.received,
                "incomplete frame abandoned"
            );
            self.perf
                .add_frame(self.expected_blocks() as u64, self.received as u64);
        }
        self.cur_frame = frame;
        self.received = 0;
        for source in self.sources.values_mut() {
            source.next_ordinal = 0;
            source.done = false;
        }
    }

    fn on_data_group(
        &mut self,
        conn: ConnId,
        group: BlockGroup,
        events: &mut Vec<DownloadEvent>,
    ) -> Result<(), WallError> {
        let frame = group.frame_id();
        if frame <= self.updated_frame || frame < self.cur_frame {
            trace!(instance = self.instance, frame, "stale group dropped");
            self.pool.release(group);
            return Ok(());
        }
        if self.must_hold(frame) {
            self.held.push_back((conn, group));
            return Ok(());
        }
        if frame > self.cur_frame {
            self.start_frame(frame);
        }

        self.perf.add_bytes(group.wire_size() as u64);
        if let Some(source) = self.sources.get_mut(&conn) {
            let first = group.header().first_ordinal.unwrap_or(source.next_ordinal);
            for (i, block) in group.blocks().iter().enumerate() {
                let ordinal = first as usize + i;
                let Some(&id) = source.ordinals.get(ordinal) else {
                    trace!(instance = self.instance, ordinal, "ordinal beyond routing table");
                    continue;
                };
                let Some(origin) = self.partition.block_rect(id) else {
                    continue;
                };
                self.montages
                    .write_block(block, origin, self.table.placements(id));
            }
            source.next_ordinal = first + group.len() as u32;
        }
        self.received += group.len();
        self.pool.release(group);

        if self.received >= self.expected_blocks() {
            self.complete_frame(events);
        }
        Ok(())
    }

    fn on_end_frame(
        &mut self,
        conn: ConnId,
        group: BlockGroup,
        events: &mut Vec<DownloadEvent>,
    ) -> Result<(), WallError> {
        let frame = group.frame_id();
        if frame <= self.updated_frame || frame < self.cur_frame {
            self.pool.release(group);
            return Ok(());
        }
        if self.must_hold(frame) {
            self.held.push_back((conn, group));
            return Ok(());
        }
        self.pool.release(group);
        if frame > self.cur_frame {
            // Nothing of this frame reached us, e.g. the window left
            // our tiles.
            self.start_frame(frame);
        }
        if let Some(source) = self.sources.get_mut(&conn) {
            source.done = true;
        }
        if self.sources.values().all(|s| s.done) {
            self.complete_frame(events);
        }
        Ok(())
    }

    fn complete_frame(&mut self, events: &mut Vec<DownloadEvent>) {
        let frame = self.cur_frame;
        self.updated_frame = frame;
        self.perf
            .add_frame(self.expected_blocks() as u64, self.received as u64);
        if self.is_synchronized() {
            trace!(instance = self.instance, frame, "frame ready");
            self.state = DownloadState::WaitSync;
            events.push(DownloadEvent::FrameReady(frame));
        } else {
            self.swap(events);
        }
    }

    fn swap(&mut self, events: &mut Vec<DownloadEvent>) {
        self.montages.swap();
        self.displayed_frame = self.updated_frame;
        self.dirty = true;
        events.push(DownloadEvent::Swapped(self.displayed_frame));
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// The sync group released `frame`: swap if it is ours and replay
    /// anything held back for it.
    pub fn process_sync(&mut self, frame: u32) -> Result<Vec<DownloadEvent>, WallError> {
        let mut events = Vec::new();
        if frame <= self.sync_frame {
            return Ok(events);
        }
        self.sync_frame = frame;
        if self.state == DownloadState::WaitSync && self.updated_frame <= frame {
            self.swap(&mut events);
            self.state = DownloadState::WaitData;
        }
        self.replay(&mut events)?;
        Ok(events)
    }

    /// Stop waiting for the coordinator, e.g. after eviction, and show
    /// the completed frame.
    pub fn release_local(&mut self) -> Result<Vec<DownloadEvent>, WallError> {
        let frame = self.updated_frame.max(self.sync_frame);
        self.sync_mode = SyncMode::None;
        let mut events = Vec::new();
        self.sync_frame = frame;
        if self.state == DownloadState::WaitSync {
            self.swap(&mut events);
            self.state = DownloadState::WaitData;
        }
        self.replay(&mut events)?;
        Ok(events)
    }

    fn replay(&mut self, events: &mut Vec<DownloadEvent>) -> Result<(), WallError> {
        let held = std::mem::take(&mut self.held);
        if !held.is_empty() {
            trace!(instance = self.instance, count = held.len(), "replaying held groups");
        }
        for (conn, group) in held {
            self.handle(conn, group, events)?;
        }
        Ok(())
    }

    /// Give every held group back to the pool.
    pub fn shutdown(&mut self) {
        for (_, group) in self.held.drain(..) {
            self.pool.release(group);
        }
        self.montages.clear();
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::GroupSpec;
    use crate::block::header::GroupHeader;
    use crate::block::pool::{GroupKind, PoolOptions};
    use crate::block::types::{FrameBuffer, PixelFormat};
    use crate::geometry::Rotation;

    const W: u32 = 64;
    const H: u32 = 32;

    fn info(sync_mode: SyncMode) -> StreamInfo {
        StreamInfo {
            image_width: W,
            image_height: H,
            block_width: 16,
            block_height: 16,
            format: PixelFormat::Luminance8,
            blocks_per_group: 4,
            sync_mode,
            frame_rate: 0,
        }
    }

    fn init(sync_mode: SyncMode) -> StreamInit {
        StreamInit {
            instance: 1,
            stream: info(sync_mode),
            route: Route::Tiles(vec![Rect::new(0, 0, W, H)]),
            tiles: vec![Rect::new(0, 0, W, H)],
            sync_group: None,
            relays: None,
        }
    }

    fn layout() -> WindowLayout {
        WindowLayout::new(Rect::new(0, 0, W, H), Rotation::Deg0)
    }

    fn pool() -> BlockPool {
        BlockPool::new(info(SyncMode::None).group_spec(), 16, PoolOptions::empty()).unwrap()
    }

    fn spec() -> GroupSpec {
        info(SyncMode::None).group_spec()
    }

    fn config_group(config_id: u32) -> BlockGroup {
        let mut g = BlockGroup::data(&spec());
        g.apply_header(GroupHeader::control(0, config_id)).unwrap();
        g.set_flag(GroupFlag::ConfigUpdate);
        g
    }

    fn end_group(frame: u32) -> BlockGroup {
        let mut g = BlockGroup::data(&spec());
        g.apply_header(GroupHeader::control(frame, 1)).unwrap();
        g.set_flag(GroupFlag::EndFrame);
        g
    }

    /// The frame's 8 blocks in two groups.
    fn frame_groups(frame: u32, image: &FrameBuffer) -> Vec<BlockGroup> {
        let partition = info(SyncMode::None).partition().unwrap();
        (0..2)
            .map(|g| {
                let mut group = BlockGroup::data(&spec());
                for id in g * 4..g * 4 + 4 {
                    let block = group.next_block_mut().unwrap();
                    partition.extract_block(image, id, block).unwrap();
                }
                group.seal(frame, 1, Some(g * 4));
                group
            })
            .collect()
    }

    fn image(seed: u8) -> FrameBuffer {
        let mut f = FrameBuffer::new(W, H, PixelFormat::Luminance8);
        f.fill_with(|i| (i as u8).wrapping_mul(seed));
        f
    }

    fn ready(sync: SyncMode) -> Downloader {
        let mut d = Downloader::new(&init(sync), pool()).unwrap();
        d.add_source(1, Route::Tiles(vec![Rect::new(0, 0, W, H)]));
        d.enqueue_config(1, layout()).unwrap();
        let ev = d.process_group(1, config_group(1)).unwrap();
        assert_eq!(ev, vec![DownloadEvent::Reconfigured { config_id: 1 }]);
        d
    }

    #[test]
    fn unsynchronized_frame_swaps_on_completion() {
        let mut d = ready(SyncMode::None);
        assert_eq!(d.state(), DownloadState::WaitData);
        assert_eq!(d.expected_blocks(), 8);
        let img = image(3);
        let mut events = Vec::new();
        for g in frame_groups(1, &img) {
            events.extend(d.process_group(1, g).unwrap());
        }
        assert_eq!(events, vec![DownloadEvent::Swapped(1)]);
        assert_eq!(d.front()[0].as_ref().unwrap().buffer(), &img);
        assert!(d.take_dirty());
    }

    #[test]
    fn data_before_layout_is_held() {
        let mut d = Downloader::new(&init(SyncMode::None), pool()).unwrap();
        d.add_source(1, Route::Tiles(vec![Rect::new(0, 0, W, H)]));
        d.process_group(1, config_group(1)).unwrap();
        assert_eq!(d.state(), DownloadState::WaitConfig);

        let img = image(5);
        for g in frame_groups(1, &img) {
            assert!(d.process_group(1, g).unwrap().is_empty());
        }
        assert_eq!(d.held_count(), 2);

        let events = d.enqueue_config(1, layout()).unwrap();
        assert_eq!(
            events,
            vec![
                DownloadEvent::Reconfigured { config_id: 1 },
                DownloadEvent::Swapped(1)
            ]
        );
        assert_eq!(d.held_count(), 0);
        assert_eq!(d.front()[0].as_ref().unwrap().buffer(), &img);
    }

    #[test]
    fn synchronized_frame_waits_for_release() {
        let mut d = ready(SyncMode::DataSync);
        let one = image(1);
        let two = image(2);
        let mut events = Vec::new();
        for g in frame_groups(1, &one) {
            events.extend(d.process_group(1, g).unwrap());
        }
        assert_eq!(events, vec![DownloadEvent::FrameReady(1)]);
        assert_eq!(d.state(), DownloadState::WaitSync);

        // Frame 2 must wait for the release of frame 1.
        for g in frame_groups(2, &two) {
            d.process_group(1, g).unwrap();
        }
        assert_eq!(d.held_count(), 2);
        assert!(d.displayed_frame() <= d.sync_frame());

        let events = d.process_sync(1).unwrap();
        assert_eq!(
            events,
            vec![DownloadEvent::Swapped(1), DownloadEvent::FrameReady(2)]
        );
        assert_eq!(d.front()[0].as_ref().unwrap().buffer(), &one);
        assert!(d.displayed_frame() <= d.sync_frame());
        assert!(d.updated_frame() <= d.sync_frame() + 1);
    }

    #[test]
    fn frame_id_gaps_do_not_stall_a_synchronized_stream() {
        let mut d = ready(SyncMode::DataSync);
        // A node that joins late sees frame 5 first.
        let mut events = Vec::new();
        for g in frame_groups(5, &image(1)) {
            events.extend(d.process_group(1, g).unwrap());
        }
        assert_eq!(events, vec![DownloadEvent::FrameReady(5)]);
        assert_eq!(d.process_sync(5).unwrap(), vec![DownloadEvent::Swapped(5)]);

        let next = image(9);
        let mut events = Vec::new();
        for g in frame_groups(7, &next) {
            events.extend(d.process_group(1, g).unwrap());
        }
        assert_eq!(events, vec![DownloadEvent::FrameReady(7)]);
        assert_eq!(d.held_count(), 0);
        assert_eq!(d.process_sync(7).unwrap(), vec![DownloadEvent::Swapped(7)]);
        assert_eq!(d.front()[0].as_ref().unwrap().buffer(), &next);
    }

    #[test]
    fn stamped_groups_apply_an_enqueued_layout() {
        // Layout first, CONFIG_UPDATE never sent on this link.
        let mut d = Downloader::new(&init(SyncMode::None), pool()).unwrap();
        d.add_source(1, Route::Tiles(vec![Rect::new(0, 0, W, H)]));
        assert!(d.enqueue_config(1, layout()).unwrap().is_empty());
        let img = image(4);
        let mut events = Vec::new();
        for g in frame_groups(3, &img) {
            events.extend(d.process_group(1, g).unwrap());
        }
        assert_eq!(
            events,
            vec![DownloadEvent::Reconfigured { config_id: 1 }, DownloadEvent::Swapped(3)]
        );
        assert_eq!(d.front()[0].as_ref().unwrap().buffer(), &img);

        // Data first, layout afterwards.
        let mut d = Downloader::new(&init(SyncMode::None), pool()).unwrap();
        d.add_source(1, Route::Tiles(vec![Rect::new(0, 0, W, H)]));
        for g in frame_groups(3, &img) {
            assert!(d.process_group(1, g).unwrap().is_empty());
        }
        assert_eq!(d.state(), DownloadState::WaitConfig);
        assert_eq!(
            d.enqueue_config(1, layout()).unwrap(),
            vec![DownloadEvent::Reconfigured { config_id: 1 }, DownloadEvent::Swapped(3)]
        );
        assert_eq!(d.held_count(), 0);
    }

    #[test]
    fn end_frame_completes_a_short_frame() {
        let mut d = ready(SyncMode::None);
        let img = image(7);
        let mut groups = frame_groups(1, &img);
        groups.truncate(1);
        let mut events = d.process_group(1, groups.remove(0)).unwrap();
        assert!(events.is_empty());
        events = d.process_group(1, end_group(1)).unwrap();
        assert_eq!(events, vec![DownloadEvent::Swapped(1)]);
    }

    #[test]
    fn hidden_layout_clears_montages() {
        let mut d = ready(SyncMode::None);
        d.enqueue_config(2, WindowLayout::default()).unwrap();
        let events = d.process_group(1, config_group(2)).unwrap();
        assert_eq!(
            events,
            vec![
                DownloadEvent::Cleared,
                DownloadEvent::Reconfigured { config_id: 2 }
            ]
        );
        assert!(d.front().is_empty());
        assert_eq!(d.expected_blocks(), 0);
    }

    #[test]
    fn unknown_source_is_rejected_and_group_returned() {
        let p = pool();
        let mut d = Downloader::new(&init(SyncMode::None), p.clone()).unwrap();
        let before = p.available(GroupKind::Data);
        let err = d.process_group(9, config_group(1)).unwrap_err();
        assert!(matches!(err, WallError::UnknownConnection(9)));
        assert_eq!(p.available(GroupKind::Data), before + 1);
    }

    #[test]
    fn depth_is_kept() {
        let mut d = ready(SyncMode::None);
        d.set_depth(0.25);
        assert_eq!(d.depth(), 0.25);
    }
}
