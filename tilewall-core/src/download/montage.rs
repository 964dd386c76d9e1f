use std::mem;

use crate::block::group::PixelBlock;
use crate::block::types::{FrameBuffer, PixelFormat};
use crate::download::table::Placement;
use crate::geometry::Rect;

/// Pixels of one tile's image region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Montage {
    region: Rect,
    buffer: FrameBuffer,
}

impl Montage {
    pub fn new(region: Rect, format: PixelFormat) -> Self {
        Self {
            region,
            buffer: FrameBuffer::new(region.width, region.height, format),
        }
    }

    /// Image-space region the montage holds.
    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Copy `area` (image space) of `block`, whose valid region starts
    /// at `origin`, into the montage.
    fn write(&mut self, block: &PixelBlock, origin: Rect, area: Rect) {
        let Some(area) = area.intersect(&self.region) else {
            return;
        };
        let bpp = self.buffer.format.bytes_per_pixel();
        let dst_stride = self.buffer.stride();
        let src_stride = block.stride();
        let row_bytes = area.width as usize * bpp;
        let src_x = (area.x - origin.x) as usize * bpp;
        let dst_x = (area.x - self.region.x) as usize * bpp;
        let src = block.data();
        for row in 0..area.height as usize {
            let src_off = ((area.y - origin.y) as usize + row) * src_stride + src_x;
            let dst_off = ((area.y - self.region.y) as usize + row) * dst_stride + dst_x;
            self.buffer.data[dst_off..dst_off + row_bytes]
                .copy_from_slice(&src[src_off..src_off + row_bytes]);
        }
    }
}

/// Front (visible) and back (being written) montages for every tile.
#[derive(Debug, Clone, Default)]
pub struct MontagePair {
    front: Vec<Option<Montage>>,
    back: Vec<Option<Montage>>,
}

impl MontagePair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reallocate both sides for new tile regions. Old content is lost.
    pub fn renew(&mut self, regions: &[Option<Rect>], format: PixelFormat) {
        let build = || -> Vec<Option<Montage>> {
            regions
                .iter()
                .map(|r| r.map(|r| Montage::new(r, format)))
                .collect()
        };
        self.front = build();
        self.back = build();
    }

    /// Drop every montage, e.g. for a zero-sized window.
    pub fn clear(&mut self) {
        self.front.clear();
        self.back.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.front.iter().all(Option::is_none)
    }

    /// Write `block` (valid region `origin`) where `placements` say.
    pub fn write_block(&mut self, block: &PixelBlock, origin: Rect, placements: &[Placement]) {
        for p in placements {
            if let Some(Some(montage)) = self.back.get_mut(p.tile) {
                montage.write(block, origin, p.area);
            }
        }
    }

    /// Make the back montages visible.
    pub fn swap(&mut self) {
        mem::swap(&mut self.front, &mut self.back);
    }

    pub fn front(&self) -> &[Option<Montage>] {
        &self.front
    }

    pub fn back(&self) -> &[Option<Montage>] {
        &self.back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::GroupSpec;

    fn block_filled(byte: u8) -> PixelBlock {
        let spec = GroupSpec {
            block_width: 4,
            block_height: 4,
            format: PixelFormat::Luminance8,
            blocks_per_group: 1,
        };
        let mut b = PixelBlock::new(&spec);
        b.data_mut().fill(byte);
        b
    }

    #[test]
    fn write_lands_in_back_until_swap() {
        let mut pair = MontagePair::new();
        pair.renew(&[Some(Rect::new(0, 0, 8, 4))], PixelFormat::Luminance8);
        let block = block_filled(7);
        let origin = Rect::new(4, 0, 4, 4);
        pair.write_block(&block, origin, &[Placement { tile: 0, area: origin }]);

        let front = pair.front()[0].as_ref().unwrap();
        assert!(front.buffer().data.iter().all(|b| *b == 0));

        pair.swap();
        let front = pair.front()[0].as_ref().unwrap();
        assert_eq!(front.buffer().row(0), &[0, 0, 0, 0, 7, 7, 7, 7]);
    }

    #[test]
    fn partial_area_is_clipped_to_region() {
        let mut pair = MontagePair::new();
        pair.renew(&[Some(Rect::new(2, 2, 4, 4))], PixelFormat::Luminance8);
        let mut block = block_filled(0);
        for (i, b) in block.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        let origin = Rect::new(0, 0, 4, 4);
        pair.write_block(&block, origin, &[Placement { tile: 0, area: origin }]);
        pair.swap();
        let m = pair.front()[0].as_ref().unwrap();
        // Block pixel (2, 2) is montage pixel (0, 0).
        assert_eq!(m.buffer().row(0), &[10, 11, 0, 0]);
        assert_eq!(m.buffer().row(1), &[14, 15, 0, 0]);
    }

    #[test]
    fn clear_drops_everything() {
        let mut pair = MontagePair::new();
        pair.renew(&[Some(Rect::new(0, 0, 4, 4)), None], PixelFormat::Rgb8);
        assert!(!pair.is_empty());
        pair.clear();
        assert!(pair.is_empty());
        assert!(pair.front().is_empty());
    }
}
