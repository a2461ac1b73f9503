//! Block tiling of the oriented image.
//!
//! The longest side is split into `max_block_count` square blocks; the other side
//! gets as many blocks as needed to cover it. Edge blocks are clipped to the image.

use tracing::debug;

use crate::geometry::Rect;

/// Smallest block edge in pixels. Larger block counts are clamped to respect it.
pub const MIN_BLOCK_EDGE: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex {
    pub row: u32,
    pub col: u32,
}

impl TileIndex {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub index: TileIndex,
    pub rect: Rect,
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    width: u32,
    height: u32,
    max_block_count: u32,
    block_size: u32,
    cols: u32,
    rows: u32,
    tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, max_block_count: u32) -> Self {
        let mut grid = Self {
            width,
            height,
            max_block_count: 0,
            block_size: 0,
            cols: 0,
            rows: 0,
            tiles: Vec::new(),
        };
        let count = grid.clamp_block_count(max_block_count);
        grid.rebuild(count);
        grid
    }

    /// Keep blocks at least `MIN_BLOCK_EDGE` wide, and at least one block.
    fn clamp_block_count(&self, count: u32) -> u32 {
        let longest = self.width.max(self.height);
        let limit = (longest / MIN_BLOCK_EDGE).max(1);
        if count > limit {
            debug!(requested = count, limit, "Clamped tile block count");
        }
        count.clamp(1, limit)
    }

    /// Change the number of blocks along the longest side.
    ///
    /// Returns false if the (clamped) count is unchanged.
    pub fn set_max_block_count(&mut self, count: u32) -> bool {
        let count = self.clamp_block_count(count);
        if count == self.max_block_count {
            return false;
        }
        self.rebuild(count);
        true
    }

    fn rebuild(&mut self, count: u32) {
        self.max_block_count = count;
        self.tiles.clear();

        let longest = self.width.max(self.height);
        if longest == 0 {
            self.block_size = 0;
            self.cols = 0;
            self.rows = 0;
            return;
        }

        self.block_size = (longest / count).max(1);
        self.cols = self.width.div_ceil(self.block_size);
        self.rows = self.height.div_ceil(self.block_size);
        self.tiles.reserve(self.cols as usize * self.rows as usize);

        for row in 0..self.rows {
            let top = row * self.block_size;
            let bottom = (top + self.block_size).min(self.height);
            for col in 0..self.cols {
                let left = col * self.block_size;
                let right = (left + self.block_size).min(self.width);
                self.tiles.push(Tile {
                    index: TileIndex::new(col, row),
                    rect: Rect::from_edges(left, top, right, bottom),
                });
            }
        }
    }

    pub fn max_block_count(&self) -> u32 {
        self.max_block_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, col: u32, row: u32) -> Option<&Tile> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        self.tiles.get((row * self.cols + col) as usize)
    }

    /// Tiles sharing at least one pixel with `viewport`, in row-major order.
    pub fn visible_tiles(&self, viewport: Rect) -> Vec<Tile> {
        self.tiles
            .iter()
            .filter(|tile| tile.rect.overlaps(&viewport))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_covers_image() {
        let grid = TileGrid::new(1000, 800, 1);
        assert_eq!(grid.block_size(), 1000);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.tiles()[0].rect, Rect::new(0, 0, 1000, 800));
    }

    #[test]
    fn test_edge_tiles_are_clipped() {
        let grid = TileGrid::new(10_000, 8_000, 4);
        assert_eq!(grid.block_size(), 2_500);
        assert_eq!((grid.cols(), grid.rows()), (4, 4));
        let corner = grid.tile(3, 3).unwrap();
        assert_eq!(corner.rect, Rect::new(7_500, 7_500, 2_500, 500));
    }

    #[test]
    fn test_tiles_cover_every_pixel_once() {
        let grid = TileGrid::new(1_234, 567, 5);
        let area: u64 = grid
            .tiles()
            .iter()
            .map(|t| t.rect.width as u64 * t.rect.height as u64)
            .sum();
        assert_eq!(area, 1_234 * 567);
    }

    #[test]
    fn test_set_max_block_count() {
        let mut grid = TileGrid::new(1000, 1000, 2);
        assert!(!grid.set_max_block_count(2));
        assert!(grid.set_max_block_count(4));
        assert_eq!(grid.len(), 16);
    }

    #[test]
    fn test_visible_tiles() {
        let grid = TileGrid::new(10_000, 8_000, 4);
        let visible = grid.visible_tiles(Rect::new(9_000, 7_000, 1_000, 800));
        let indices: Vec<_> = visible.iter().map(|t| t.index).collect();
        assert_eq!(
            indices,
            vec![TileIndex::new(3, 2), TileIndex::new(3, 3)]
        );
    }

    #[test]
    fn test_boundary_aligned_viewport_skips_neighbours() {
        let grid = TileGrid::new(10_000, 8_000, 4);
        let visible = grid.visible_tiles(Rect::new(0, 0, 2_500, 2_500));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].index, TileIndex::new(0, 0));
    }

    #[test]
    fn test_huge_block_count_is_clamped() {
        let grid = TileGrid::new(70_000, 70_000, 70_000);
        assert_eq!(grid.block_size(), MIN_BLOCK_EDGE);
        assert_eq!(grid.max_block_count(), 70_000 / MIN_BLOCK_EDGE);
        assert_eq!(grid.len(), grid.cols() as usize * grid.rows() as usize);

        let mut small = TileGrid::new(100, 50, 1);
        assert!(!small.set_max_block_count(u32::MAX));
        assert_eq!(small.len(), 1);
    }

    #[test]
    fn test_empty_image_has_no_tiles() {
        let grid = TileGrid::new(0, 0, 4);
        assert!(grid.is_empty());
        assert!(grid.tile(0, 0).is_none());
    }
}
