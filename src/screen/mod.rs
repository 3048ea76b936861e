pub mod tile;

use std::collections::HashSet;

use crate::error::PipelineError;

use tile::{Tile, TileHandle, TilePatch};

/// Largest supported tile side. Region coordinates travel as u16.
const MAX_TILE_SIDE: usize = 4096;

/// A fixed grid of display tiles and their delivery state.
///
/// The screen itself never talks to a transport. It hands out diffs and
/// snapshots; the dispatcher decides what ships and commits the result
/// back through the tile mutators.
#[derive(Debug, Clone)]
pub struct Screen {
    cols: u32,
    rows: u32,
    side: usize,
    tiles: Vec<Tile>,
}

impl Screen {
    /// Build a grid with caller-assigned handles, row-major order.
    pub fn new(
        cols: u32,
        rows: u32,
        side: usize,
        handles: &[TileHandle],
    ) -> Result<Screen, PipelineError> {
        if cols == 0 || rows == 0 {
            return Err(PipelineError::screen(format!(
                "screen grid {cols}x{rows} is degenerate"
            )));
        }
        if side == 0 || side > MAX_TILE_SIDE {
            return Err(PipelineError::screen(format!(
                "tile side {side} is outside 1..={MAX_TILE_SIDE}"
            )));
        }
        let count = cols as usize * rows as usize;
        if handles.len() != count {
            return Err(PipelineError::screen(format!(
                "{cols}x{rows} grid needs {count} handles, got {}",
                handles.len()
            )));
        }
        let mut seen = HashSet::with_capacity(count);
        for handle in handles {
            if !seen.insert(handle.0) {
                return Err(PipelineError::screen(format!(
                    "tile handle {} assigned twice",
                    handle.0
                )));
            }
        }

        let mut tiles = Vec::with_capacity(count);
        for y in 0..rows {
            for x in 0..cols {
                let index = (y as usize) * cols as usize + x as usize;
                tiles.push(Tile::new(handles[index], x, y, index, side));
            }
        }
        Ok(Screen {
            cols,
            rows,
            side,
            tiles,
        })
    }

    /// Convenience constructor for handles `first, first+1, ..`.
    pub fn with_sequential_handles(
        cols: u32,
        rows: u32,
        side: usize,
        first: u32,
    ) -> Result<Screen, PipelineError> {
        let count = cols as usize * rows as usize;
        let handles: Vec<TileHandle> = (0..count as u32).map(|i| TileHandle(first + i)).collect();
        Screen::new(cols, rows, side, &handles)
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_area(&self) -> usize {
        self.side * self.side
    }

    /// Canvas width in pixels.
    pub fn pixel_width(&self) -> usize {
        self.cols as usize * self.side
    }

    /// Canvas height in pixels.
    pub fn pixel_height(&self) -> usize {
        self.rows as usize * self.side
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, index: usize) -> &Tile {
        &self.tiles[index]
    }

    pub fn tile_at(&self, x: u32, y: u32) -> &Tile {
        &self.tiles[(y as usize) * self.cols as usize + x as usize]
    }

    pub(crate) fn tile_mut(&mut self, index: usize) -> &mut Tile {
        &mut self.tiles[index]
    }

    /// Force full resends, e.g. when a viewer's display state is unknown.
    pub fn invalidate_all(&mut self) {
        for tile in &mut self.tiles {
            tile.request_full_update();
        }
    }

    /// Current content for a late joiner. Tiles that never held anything
    /// visible are skipped.
    pub fn snapshot(&self) -> Vec<TilePatch> {
        self.tiles
            .iter()
            .filter_map(|tile| {
                let data = tile.snapshot_data()?;
                if data.iter().all(|&p| p == 0) {
                    return None;
                }
                Some(TilePatch::full(
                    tile.handle(),
                    tile.side(),
                    data.to_vec().into_boxed_slice(),
                ))
            })
            .collect()
    }

    /// Paint every tile one color immediately, bypassing the dispatcher.
    pub fn fill(&mut self, color: u8) -> Vec<TilePatch> {
        self.tiles
            .iter_mut()
            .map(|tile| {
                let data = tile.fill(color);
                TilePatch::full(tile.handle(), tile.side(), data)
            })
            .collect()
    }
}
