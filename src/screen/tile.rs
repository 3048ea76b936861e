use crate::config::TrackerConfig;

/// Identity of a tile on the remote display, assigned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHandle(pub u32);

/// Changed area of one tile, cropped to its bounding box.
///
/// `data` is row-major palette indices, exactly `width * height` bytes.
/// `changed` is the real changed pixel count inside the box, which may be
/// far smaller than the box itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub data: Box<[u8]>,
    pub changed: u32,
}

impl DirtyRegion {
    pub fn data_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_full(&self, side: usize) -> bool {
        self.x == 0
            && self.y == 0
            && self.width as usize == side
            && self.height as usize == side
    }
}

/// Outcome of comparing a tile's fresh pixels against what was last sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileDiff {
    Unchanged,
    /// Below the noise thresholds; the change count still accumulates so
    /// a persistent flicker cannot be silenced forever.
    Suppressed { changed: u32 },
    Region(DirtyRegion),
}

/// Wire record for one tile update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePatch {
    pub target: TileHandle,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub data: Box<[u8]>,
}

impl TilePatch {
    pub fn full(target: TileHandle, side: usize, data: Box<[u8]>) -> TilePatch {
        assert_eq!(data.len(), side * side, "full patch with partial data");
        TilePatch {
            target,
            x: 0,
            y: 0,
            width: side as u16,
            height: side as u16,
            data,
        }
    }

    pub fn from_region(target: TileHandle, region: DirtyRegion) -> TilePatch {
        assert!(!region.data.is_empty(), "patch built from an empty region");
        TilePatch {
            target,
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            data: region.data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One display tile and its delivery state.
///
/// `last_sent` is what the remote display currently shows, `last_processed`
/// the newest computed pixels whether or not they shipped. Only the
/// dispatcher mutates delivery state, so `diff` can stay a pure read.
#[derive(Debug, Clone)]
pub struct Tile {
    handle: TileHandle,
    tile_x: u32,
    tile_y: u32,
    index: usize,
    side: usize,
    last_sent: Option<Box<[u8]>>,
    last_processed: Option<Box<[u8]>>,
    needs_full_update: bool,
    staleness: u32,
    accumulated: u32,
}

impl Tile {
    pub(crate) fn new(handle: TileHandle, tile_x: u32, tile_y: u32, index: usize, side: usize) -> Tile {
        Tile {
            handle,
            tile_x,
            tile_y,
            index,
            side,
            last_sent: None,
            last_processed: None,
            needs_full_update: true,
            staleness: 0,
            accumulated: 0,
        }
    }

    pub fn handle(&self) -> TileHandle {
        self.handle
    }

    pub fn tile_x(&self) -> u32 {
        self.tile_x
    }

    pub fn tile_y(&self) -> u32 {
        self.tile_y
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn area(&self) -> usize {
        self.side * self.side
    }

    /// Cycles in a row this tile's nonzero change was deferred.
    pub fn staleness(&self) -> u32 {
        self.staleness
    }

    /// Changed pixels swallowed by those deferrals.
    pub fn accumulated(&self) -> u32 {
        self.accumulated
    }

    pub fn needs_full_update(&self) -> bool {
        self.needs_full_update
    }

    /// Best pixels available for a late joiner, preferring what the
    /// display already shows.
    pub fn snapshot_data(&self) -> Option<&[u8]> {
        self.last_sent
            .as_deref()
            .or(self.last_processed.as_deref())
    }

    /// Compare fresh pixels against the last committed send.
    pub fn diff(&self, new_data: &[u8], cfg: &TrackerConfig) -> TileDiff {
        let side = self.side;
        let area = side * side;
        assert_eq!(new_data.len(), area, "tile data size mismatch");

        let sent = match (&self.last_sent, self.needs_full_update) {
            (Some(sent), false) => sent,
            _ => return TileDiff::Region(self.full_region(new_data, area as u32)),
        };
        if sent.as_ref() == new_data {
            return TileDiff::Unchanged;
        }

        // Word-stride scan: whole rows reject in one compare, unequal
        // rows narrow to 8 byte words before touching single pixels.
        let mut changed = 0u32;
        let mut min_x = usize::MAX;
        let mut max_x = 0usize;
        let mut min_y = usize::MAX;
        let mut max_y = 0usize;
        for y in 0..side {
            let off = y * side;
            let old_row = &sent[off..off + side];
            let new_row = &new_data[off..off + side];
            if old_row == new_row {
                continue;
            }
            let mut row_min = usize::MAX;
            let mut row_max = 0usize;
            let mut x = 0;
            while x < side {
                let end = (x + 8).min(side);
                if old_row[x..end] != new_row[x..end] {
                    for i in x..end {
                        if old_row[i] != new_row[i] {
                            changed += 1;
                            if i < row_min {
                                row_min = i;
                            }
                            row_max = i;
                        }
                    }
                }
                x = end;
            }
            if row_min != usize::MAX {
                if min_y == usize::MAX {
                    min_y = y;
                }
                max_y = y;
                min_x = min_x.min(row_min);
                max_x = max_x.max(row_max);
            }
        }
        if changed == 0 {
            return TileDiff::Unchanged;
        }

        let density = changed as f32 / area as f32;
        // Deferred changes build pressure until they clear whichever noise
        // threshold is higher for this tile size, so nothing is silenced
        // forever.
        let escalation = cfg
            .min_changed_pixels
            .max((cfg.min_change_density * area as f32).ceil() as u32);
        let escalated = changed + self.accumulated >= escalation;
        if !escalated
            && (changed < cfg.min_changed_pixels || density < cfg.min_change_density)
        {
            return TileDiff::Suppressed { changed };
        }

        let box_width = max_x - min_x + 1;
        let box_height = max_y - min_y + 1;
        // A change smeared over most of the tile resends the whole tile;
        // the box would carry nearly as many bytes anyway.
        if (box_width * box_height) as f32 > area as f32 * cfg.full_tile_area
            && density > cfg.full_tile_density
        {
            return TileDiff::Region(self.full_region(new_data, changed));
        }

        let mut data = vec![0u8; box_width * box_height];
        for (i, y) in (min_y..=max_y).enumerate() {
            let src = y * side + min_x;
            data[i * box_width..(i + 1) * box_width]
                .copy_from_slice(&new_data[src..src + box_width]);
        }
        TileDiff::Region(DirtyRegion {
            x: min_x as u16,
            y: min_y as u16,
            width: box_width as u16,
            height: box_height as u16,
            data: data.into_boxed_slice(),
            changed,
        })
    }

    fn full_region(&self, new_data: &[u8], changed: u32) -> DirtyRegion {
        DirtyRegion {
            x: 0,
            y: 0,
            width: self.side as u16,
            height: self.side as u16,
            data: new_data.to_vec().into_boxed_slice(),
            changed,
        }
    }

    /// Commit a send: the display now shows `data`.
    pub(crate) fn mark_sent(&mut self, data: Box<[u8]>) {
        self.last_sent = Some(data);
        self.needs_full_update = false;
        self.staleness = 0;
        self.accumulated = 0;
    }

    /// Record that a nonzero change was withheld this cycle.
    pub(crate) fn mark_deferred(&mut self, changed: u32) {
        self.staleness = self.staleness.saturating_add(1);
        self.accumulated = self.accumulated.saturating_add(changed);
    }

    /// Newest computed pixels, shipped or not.
    pub(crate) fn set_last_processed(&mut self, data: Box<[u8]>) {
        self.last_processed = Some(data);
    }

    /// Force the next diff to resend everything, e.g. after a viewer joins
    /// with unknown display contents.
    pub(crate) fn request_full_update(&mut self) {
        self.needs_full_update = true;
    }

    pub(crate) fn fill(&mut self, color: u8) -> Box<[u8]> {
        let data = vec![color; self.area()].into_boxed_slice();
        self.last_sent = Some(data.clone());
        self.last_processed = Some(data.clone());
        self.needs_full_update = false;
        self.staleness = 0;
        self.accumulated = 0;
        data
    }
}
