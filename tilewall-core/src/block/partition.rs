//! Division of an image into a row-major grid of fixed-size blocks.
//!
//! Block `id` sits at column `id % blocks_x`, row `id / blocks_x`. Edge
//! blocks are clipped to the image; their payload keeps the full block
//! pitch and the remainder is zero padding.
//!
//! The streamer and every downloader derive the same per-destination
//! routing table from a [`BlockPartition`], a window layout and the
//! destination's tiles, which is how positional block ids resolve on
//! the receiving side.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::block::group::PixelBlock;
use crate::block::types::FrameBuffer;
use crate::error::WallError;
use crate::geometry::{Rect, WindowLayout};

/// How a sender chooses the blocks one destination receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    /// Blocks visible in any of these wall-space tiles under the
    /// current layout.
    Tiles(Vec<Rect>),
    /// A fixed contiguous id range, independent of layout.
    Blocks { start: u32, end: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPartition {
    image_width: u32,
    image_height: u32,
    block_width: u32,
    block_height: u32,
    blocks_x: u32,
    blocks_y: u32,
}

impl BlockPartition {
    pub fn new(
        image_width: u32,
        image_height: u32,
        block_width: u32,
        block_height: u32,
    ) -> Result<Self, WallError> {
        if block_width == 0 || block_height == 0 {
            return Err(WallError::InvalidConfig(format!(
                "block size must be non-zero, got {block_width}x{block_height}"
            )));
        }
        Ok(Self {
            image_width,
            image_height,
            block_width,
            block_height,
            blocks_x: image_width.div_ceil(block_width),
            blocks_y: image_height.div_ceil(block_height),
        })
    }

    pub fn image_rect(&self) -> Rect {
        Rect::new(0, 0, self.image_width, self.image_height)
    }

    pub fn block_width(&self) -> u32 {
        self.block_width
    }

    pub fn block_height(&self) -> u32 {
        self.block_height
    }

    pub fn blocks_x(&self) -> u32 {
        self.blocks_x
    }

    pub fn blocks_y(&self) -> u32 {
        self.blocks_y
    }

    /// Total number of blocks covering the image.
    pub fn block_count(&self) -> u32 {
        self.blocks_x * self.blocks_y
    }

    /// Valid image-space region of block `id`.
    pub fn block_rect(&self, id: u32) -> Option<Rect> {
        if id >= self.block_count() {
            return None;
        }
        let x = (id % self.blocks_x) * self.block_width;
        let y = (id / self.blocks_x) * self.block_height;
        let w = self.block_width.min(self.image_width - x);
        let h = self.block_height.min(self.image_height - y);
        Some(Rect::new(x as i32, y as i32, w, h))
    }

    /// Ids of every block touching `region`, ascending.
    pub fn blocks_in(&self, region: &Rect) -> Vec<u32> {
        let Some(clipped) = region.intersect(&self.image_rect()) else {
            return Vec::new();
        };
        let col0 = clipped.x as u32 / self.block_width;
        let row0 = clipped.y as u32 / self.block_height;
        let col1 = (clipped.right() as u32).div_ceil(self.block_width);
        let row1 = (clipped.bottom() as u32).div_ceil(self.block_height);

        let mut ids = Vec::with_capacity(((col1 - col0) * (row1 - row0)) as usize);
        for row in row0..row1 {
            for col in col0..col1 {
                ids.push(row * self.blocks_x + col);
            }
        }
        ids
    }

    /// Image region `tile` displays under `layout`, grown to the block
    /// grid and clamped to the image.
    pub fn tile_region(&self, layout: &WindowLayout, tile: &Rect) -> Option<Rect> {
        let region = layout.image_region(tile, self.image_width, self.image_height)?;
        region
            .align_to(self.block_width, self.block_height)
            .intersect(&self.image_rect())
    }

    /// Sorted, de-duplicated block ids a destination with `tiles` needs.
    /// The position of an id in this list is its ordinal on the wire.
    pub fn routing_table(&self, layout: &WindowLayout, tiles: &[Rect]) -> Vec<u32> {
        let mut ids = BTreeSet::new();
        for tile in tiles {
            if let Some(region) = self.tile_region(layout, tile) {
                ids.extend(self.blocks_in(&region));
            }
        }
        ids.into_iter().collect()
    }

    /// Ordered block ids `route` selects under `layout`.
    pub fn route_table(&self, layout: &WindowLayout, route: &Route) -> Vec<u32> {
        match route {
            Route::Tiles(tiles) => self.routing_table(layout, tiles),
            Route::Blocks { start, end } => {
                let end = (*end).min(self.block_count());
                let start = (*start).min(end);
                (start..end).collect()
            }
        }
    }

    /// Copy block `id` out of `frame` into `block`, zeroing the padding.
    pub fn extract_block(
        &self,
        frame: &FrameBuffer,
        id: u32,
        block: &mut PixelBlock,
    ) -> Result<(), WallError> {
        if frame.width != self.image_width || frame.height != self.image_height {
            return Err(WallError::InvalidConfig(format!(
                "frame {}x{} does not match partition {}x{}",
                frame.width, frame.height, self.image_width, self.image_height
            )));
        }
        if frame.format != block.format {
            return Err(WallError::InvalidConfig(format!(
                "frame format {:?} does not match block format {:?}",
                frame.format, block.format
            )));
        }
        let rect = self.block_rect(id).ok_or_else(|| {
            WallError::InvalidConfig(format!(
                "block {id} outside partition of {}",
                self.block_count()
            ))
        })?;

        let bpp = frame.format.bytes_per_pixel();
        let src_stride = frame.stride();
        let dst_stride = block.stride();
        let row_bytes = rect.width as usize * bpp;
        let left = rect.x as usize * bpp;

        block.id = id;
        block.rect = rect;
        let dst = block.data_mut();
        dst.fill(0);
        for row in 0..rect.height as usize {
            let src_off = (rect.y as usize + row) * src_stride + left;
            let dst_off = row * dst_stride;
            dst[dst_off..dst_off + row_bytes]
                .copy_from_slice(&frame.data[src_off..src_off + row_bytes]);
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::GroupSpec;
    use crate::block::types::PixelFormat;
    use crate::geometry::Rotation;

    #[test]
    fn full_hd_at_256_has_forty_blocks() {
        let p = BlockPartition::new(1920, 1080, 256, 256).unwrap();
        assert_eq!(p.blocks_x(), 8);
        assert_eq!(p.blocks_y(), 5);
        assert_eq!(p.block_count(), 40);
    }

    #[test]
    fn edge_block_is_clipped() {
        let p = BlockPartition::new(1920, 1080, 256, 256).unwrap();
        assert_eq!(p.block_rect(7), Some(Rect::new(1792, 0, 128, 256)));
        assert_eq!(p.block_rect(39), Some(Rect::new(1792, 1024, 128, 56)));
        assert_eq!(p.block_rect(40), None);
    }

    #[test]
    fn zero_block_size_rejected() {
        assert!(BlockPartition::new(10, 10, 0, 4).is_err());
    }

    #[test]
    fn blocks_in_region() {
        let p = BlockPartition::new(100, 100, 10, 10).unwrap();
        assert_eq!(p.blocks_in(&Rect::new(5, 5, 10, 1)), vec![0, 1]);
        assert_eq!(p.blocks_in(&Rect::new(90, 90, 50, 50)), vec![99]);
        assert!(p.blocks_in(&Rect::new(200, 0, 5, 5)).is_empty());
    }

    #[test]
    fn routing_table_splits_between_tiles() {
        let p = BlockPartition::new(1920, 1080, 256, 256).unwrap();
        let layout = WindowLayout::new(Rect::new(0, 0, 1920, 1080), Rotation::Deg0);
        let left = p.routing_table(&layout, &[Rect::new(0, 0, 960, 1080)]);
        let right = p.routing_table(&layout, &[Rect::new(960, 0, 960, 1080)]);
        // Column 3 (768..1024) straddles the seam.
        assert_eq!(left.len(), 4 * 5);
        assert_eq!(right.len(), 5 * 5);
        let both = p.routing_table(
            &layout,
            &[Rect::new(0, 0, 960, 1080), Rect::new(960, 0, 960, 1080)],
        );
        assert_eq!(both, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn routing_table_is_idempotent() {
        let p = BlockPartition::new(1000, 700, 128, 128).unwrap();
        let layout = WindowLayout::new(Rect::new(100, 50, 1500, 900), Rotation::Deg90);
        let tiles = [Rect::new(0, 0, 800, 600), Rect::new(800, 0, 800, 600)];
        assert_eq!(p.routing_table(&layout, &tiles), p.routing_table(&layout, &tiles));
    }

    #[test]
    fn block_range_route_ignores_layout() {
        let p = BlockPartition::new(1920, 1080, 256, 256).unwrap();
        let hidden = WindowLayout::default();
        let route = Route::Blocks { start: 30, end: 50 };
        assert_eq!(p.route_table(&hidden, &route), (30..40).collect::<Vec<_>>());
        let tiles = Route::Tiles(vec![Rect::new(0, 0, 1920, 1080)]);
        assert!(p.route_table(&hidden, &tiles).is_empty());
    }

    #[test]
    fn extract_pads_edge_block() {
        let p = BlockPartition::new(6, 3, 4, 4).unwrap();
        let mut frame = FrameBuffer::new(6, 3, PixelFormat::Luminance8);
        frame.fill_with(|i| i as u8 + 1);
        let spec = GroupSpec {
            block_width: 4,
            block_height: 4,
            format: PixelFormat::Luminance8,
            blocks_per_group: 1,
        };
        let mut block = PixelBlock::new(&spec);
        p.extract_block(&frame, 1, &mut block).unwrap();
        assert_eq!(block.rect, Rect::new(4, 0, 2, 3));
        assert_eq!(
            block.data(),
            &[5, 6, 0, 0, 11, 12, 0, 0, 17, 18, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(block.valid_row(2), &[17, 18]);
    }

    #[test]
    fn extract_rejects_wrong_frame() {
        let p = BlockPartition::new(8, 8, 4, 4).unwrap();
        let frame = FrameBuffer::new(4, 4, PixelFormat::Luminance8);
        let spec = GroupSpec {
            block_width: 4,
            block_height: 4,
            format: PixelFormat::Luminance8,
            blocks_per_group: 1,
        };
        let mut block = PixelBlock::new(&spec);
        assert!(p.extract_block(&frame, 0, &mut block).is_err());
    }
}
