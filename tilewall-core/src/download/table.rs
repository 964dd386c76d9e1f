use std::collections::BTreeMap;

use crate::block::partition::BlockPartition;
use crate::geometry::{Rect, WindowLayout};

/// Where part of a block lands: the image-space `area` of the block
/// that falls inside montage `tile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub tile: usize,
    pub area: Rect,
}

/// Block id to montage placement map for one node's tiles under one
/// layout. Rebuilt on every layout change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileTable {
    /// Image region each tile shows, `None` if the window misses it.
    regions: Vec<Option<Rect>>,
    placements: BTreeMap<u32, Vec<Placement>>,
}

impl TileTable {
    pub fn build(partition: &BlockPartition, layout: &WindowLayout, tiles: &[Rect]) -> Self {
        let regions: Vec<Option<Rect>> = tiles
            .iter()
            .map(|tile| partition.tile_region(layout, tile))
            .collect();

        let mut placements: BTreeMap<u32, Vec<Placement>> = BTreeMap::new();
        for (tile, region) in regions.iter().enumerate() {
            let Some(region) = region else { continue };
            for id in partition.blocks_in(region) {
                let Some(area) = partition
                    .block_rect(id)
                    .and_then(|rect| rect.intersect(region))
                else {
                    continue;
                };
                placements.entry(id).or_default().push(Placement { tile, area });
            }
        }
        Self { regions, placements }
    }

    pub fn regions(&self) -> &[Option<Rect>] {
        &self.regions
    }

    pub fn placements(&self, id: u32) -> &[Placement] {
        self.placements.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: u32) -> bool {
        self.placements.contains_key(&id)
    }

    /// Distinct blocks this node displays.
    pub fn block_count(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;

    fn partition() -> BlockPartition {
        BlockPartition::new(1920, 1080, 256, 256).unwrap()
    }

    #[test]
    fn single_tile_covers_every_block() {
        let layout = WindowLayout::new(Rect::new(0, 0, 1920, 1080), Rotation::Deg0);
        let table = TileTable::build(&partition(), &layout, &[Rect::new(0, 0, 1920, 1080)]);
        assert_eq!(table.block_count(), 40);
        assert_eq!(table.regions(), &[Some(Rect::new(0, 0, 1920, 1080))]);
        // Bottom-right block is clipped to the image.
        assert_eq!(
            table.placements(39),
            &[Placement {
                tile: 0,
                area: Rect::new(1792, 1024, 128, 56)
            }]
        );
    }

    #[test]
    fn shared_column_is_placed_twice() {
        let layout = WindowLayout::new(Rect::new(0, 0, 1920, 1080), Rotation::Deg0);
        let tiles = [Rect::new(0, 0, 1000, 1080), Rect::new(1000, 0, 920, 1080)];
        let table = TileTable::build(&partition(), &layout, &tiles);
        // Column 3 (x 768..1024) straddles the tile seam at x = 1000.
        let places = table.placements(3);
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].tile, 0);
        assert_eq!(places[1].tile, 1);
    }

    #[test]
    fn hidden_window_has_no_blocks() {
        let layout = WindowLayout::new(Rect::new(0, 0, 0, 0), Rotation::Deg0);
        let table = TileTable::build(&partition(), &layout, &[Rect::new(0, 0, 1920, 1080)]);
        assert!(table.is_empty());
        assert_eq!(table.regions(), &[None]);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let layout = WindowLayout::new(Rect::new(100, 50, 1600, 900), Rotation::Deg90);
        let tiles = [Rect::new(0, 0, 960, 1080), Rect::new(960, 0, 960, 1080)];
        let a = TileTable::build(&partition(), &layout, &tiles);
        let b = TileTable::build(&partition(), &layout, &tiles);
        assert_eq!(a, b);
    }
}
