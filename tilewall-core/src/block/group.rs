//! Pixel blocks and the groups they travel in.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::header::{GROUP_HEADER_SIZE, GroupFlag, GroupHeader};
use crate::block::types::PixelFormat;
use crate::error::WallError;
use crate::geometry::Rect;

static NEXT_GROUP_UID: AtomicU64 = AtomicU64::new(1);

// ── GroupSpec ────────────────────────────────────────────────────

/// Fixed dimensions shared by every group of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    /// Block width in pixels.
    pub block_width: u32,
    /// Block height in pixels.
    pub block_height: u32,
    /// Pixel layout of payloads.
    pub format: PixelFormat,
    /// Maximum blocks carried by one group.
    pub blocks_per_group: usize,
}

impl GroupSpec {
    /// Payload bytes of one block on the wire.
    pub fn block_size(&self) -> usize {
        self.block_width as usize * self.block_height as usize * self.format.bytes_per_pixel()
    }

    /// Bytes of a full group including its header.
    pub fn group_bytes(&self) -> usize {
        GROUP_HEADER_SIZE + self.blocks_per_group * self.block_size()
    }
}

// ── PixelBlock ───────────────────────────────────────────────────

/// One rectangular region of an image.
///
/// `data` always holds `block_width * block_height * bpp` bytes with a
/// row pitch of `block_width * bpp`; `rect` may be smaller at the image
/// edges, the rest is padding.
#[derive(Debug, Clone)]
pub struct PixelBlock {
    /// Position in the stream's partition.
    pub id: u32,
    /// Valid region in image space.
    pub rect: Rect,
    pub format: PixelFormat,
    block_width: u32,
    data: Vec<u8>,
}

impl PixelBlock {
    pub fn new(spec: &GroupSpec) -> Self {
        Self {
            id: 0,
            rect: Rect::default(),
            format: spec.format,
            block_width: spec.block_width,
            data: vec![0; spec.block_size()],
        }
    }

    pub fn stride(&self) -> usize {
        self.block_width as usize * self.format.bytes_per_pixel()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Row `y` of the valid region, relative to the block origin.
    pub fn valid_row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride();
        let len = self.rect.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }
}

// ── BlockGroup ───────────────────────────────────────────────────

/// An ordered batch of blocks shipped under one header.
///
/// Data groups own `blocks_per_group` preallocated blocks of which the
/// first `len()` are active. Control groups own none.
#[derive(Debug)]
pub struct BlockGroup {
    uid: u64,
    header: GroupHeader,
    flag: GroupFlag,
    blocks: Vec<PixelBlock>,
    len: usize,
    block_size: usize,
}

impl BlockGroup {
    /// A payload-bearing group with preallocated blocks.
    pub fn data(spec: &GroupSpec) -> Self {
        Self {
            uid: NEXT_GROUP_UID.fetch_add(1, Ordering::Relaxed),
            header: GroupHeader::default(),
            flag: GroupFlag::PixelData,
            blocks: (0..spec.blocks_per_group)
                .map(|_| PixelBlock::new(spec))
                .collect(),
            len: 0,
            block_size: spec.block_size(),
        }
    }

    /// A zero-payload signaling group.
    pub fn control(spec: &GroupSpec) -> Self {
        Self {
            uid: NEXT_GROUP_UID.fetch_add(1, Ordering::Relaxed),
            header: GroupHeader::default(),
            flag: GroupFlag::EndFrame,
            blocks: Vec::new(),
            len: 0,
            block_size: spec.block_size(),
        }
    }

    /// Process-unique identity, stable across pool cycles.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn header(&self) -> &GroupHeader {
        &self.header
    }

    pub fn flag(&self) -> GroupFlag {
        self.flag
    }

    pub fn set_flag(&mut self, flag: GroupFlag) {
        self.flag = flag;
    }

    pub fn frame_id(&self) -> u32 {
        self.header.frame_id
    }

    pub fn config_id(&self) -> u32 {
        self.header.config_id
    }

    pub fn is_data_group(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum blocks this group can hold.
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Number of active blocks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.blocks.len()
    }

    /// Active payload bytes (excluding the header).
    pub fn data_size(&self) -> usize {
        self.len * self.block_size
    }

    /// Bytes this group occupies on the wire.
    pub fn wire_size(&self) -> usize {
        GROUP_HEADER_SIZE + self.data_size()
    }

    pub fn blocks(&self) -> &[PixelBlock] {
        &self.blocks[..self.len]
    }

    pub fn block(&self, idx: usize) -> Option<&PixelBlock> {
        self.blocks().get(idx)
    }

    /// Claim the next free block slot, or `None` when full.
    pub fn next_block_mut(&mut self) -> Option<&mut PixelBlock> {
        if self.is_full() {
            return None;
        }
        self.len += 1;
        self.blocks.get_mut(self.len - 1)
    }

    /// Stamp the header for sending. Flag follows the block count.
    pub fn seal(&mut self, frame_id: u32, config_id: u32, first_ordinal: Option<u32>) {
        let mut header = GroupHeader::new(self.len as u32, frame_id, config_id);
        header.first_ordinal = first_ordinal;
        self.header = header;
        if self.len > 0 {
            self.flag = GroupFlag::PixelData;
        }
    }

    /// Stamp a control header.
    pub fn seal_control(&mut self, flag: GroupFlag, frame_id: u32, config_id: u32) {
        self.len = 0;
        self.header = GroupHeader::control(frame_id, config_id).with_kind(flag);
        self.flag = flag;
    }

    /// Adopt a header read from the wire; the block payloads that follow
    /// are read into the first `block_count` slots.
    pub fn apply_header(&mut self, header: GroupHeader) -> Result<(), WallError> {
        let count = header.block_count as usize;
        if count > self.blocks.len() {
            return Err(WallError::UnexpectedBlockCount {
                count,
                capacity: self.blocks.len(),
            });
        }
        self.len = count;
        self.header = header;
        self.flag = if count > 0 {
            GroupFlag::PixelData
        } else {
            header.kind.unwrap_or(GroupFlag::ConfigUpdate)
        };
        Ok(())
    }

    /// Mutable access to the first `len()` payload buffers, for reads.
    pub(crate) fn payloads_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.blocks[..self.len].iter_mut().map(|b| b.data_mut())
    }

    /// Forget all content before returning to a pool.
    pub fn reset(&mut self) {
        self.len = 0;
        self.header = GroupHeader::default();
        self.flag = if self.blocks.is_empty() {
            GroupFlag::EndFrame
        } else {
            GroupFlag::PixelData
        };
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GroupSpec {
        GroupSpec {
            block_width: 4,
            block_height: 4,
            format: PixelFormat::Rgb8,
            blocks_per_group: 3,
        }
    }

    #[test]
    fn sizes() {
        let s = spec();
        assert_eq!(s.block_size(), 48);
        assert_eq!(s.group_bytes(), GROUP_HEADER_SIZE + 144);
    }

    #[test]
    fn fill_until_full() {
        let mut g = BlockGroup::data(&spec());
        assert!(g.is_empty());
        for i in 0..3 {
            let b = g.next_block_mut().unwrap();
            b.id = i;
        }
        assert!(g.is_full());
        assert!(g.next_block_mut().is_none());
        g.seal(7, 1, Some(0));
        assert_eq!(g.header().block_count, 3);
        assert_eq!(g.wire_size(), GROUP_HEADER_SIZE + 144);
        assert_eq!(g.flag(), GroupFlag::PixelData);
    }

    #[test]
    fn apply_header_rejects_oversized_count() {
        let mut g = BlockGroup::data(&spec());
        let err = g.apply_header(GroupHeader::new(4, 1, 1)).unwrap_err();
        assert!(matches!(err, WallError::UnexpectedBlockCount { count: 4, .. }));
    }

    #[test]
    fn control_group_has_no_payload() {
        let mut g = BlockGroup::control(&spec());
        g.seal_control(GroupFlag::ConfigUpdate, 3, 2);
        assert!(!g.is_data_group());
        assert_eq!(g.wire_size(), GROUP_HEADER_SIZE);
        assert!(g.header().is_control());
    }

    #[test]
    fn uids_are_unique() {
        let a = BlockGroup::data(&spec());
        let b = BlockGroup::data(&spec());
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn reset_clears_content() {
        let mut g = BlockGroup::data(&spec());
        g.next_block_mut().unwrap();
        g.seal(1, 1, None);
        g.reset();
        assert!(g.is_empty());
        assert_eq!(g.frame_id(), 0);
    }
}
