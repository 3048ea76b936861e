use rayon::prelude::*;

use crate::error::PipelineError;

/// Bits kept per channel when keying the lookup tables.
const KEY_BITS: u32 = 7;
/// Cells along one axis of the lookup cube.
const KEY_SIDE: usize = 1 << KEY_BITS;
/// Total cells in the lookup cube.
const TABLE_LEN: usize = KEY_SIDE * KEY_SIDE * KEY_SIDE;
/// Cells in one red slice, the unit of parallel table construction.
const SLICE_LEN: usize = KEY_SIDE * KEY_SIDE;

/// Index 0 never leaves the quantizer. Display targets treat it as "no
/// pixel", so matching always starts at index 1.
pub const RESERVED_INDEX: u8 = 0;

/// An indexed color table of at most 256 entries, index 0 reserved.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: Box<[u32]>,
}

impl Palette {
    pub fn new(colors: &[(u8, u8, u8)]) -> Result<Palette, PipelineError> {
        if colors.len() < 2 {
            return Err(PipelineError::palette(
                "palette needs at least one matchable color after the reserved slot",
            ));
        }
        if colors.len() > 256 {
            return Err(PipelineError::palette(format!(
                "palette has {} entries, limit is 256",
                colors.len()
            )));
        }
        let colors = colors
            .iter()
            .map(|&(r, g, b)| pack(r, g, b))
            .collect::<Vec<u32>>()
            .into_boxed_slice();
        Ok(Palette { colors })
    }

    /// Stock palette: a 6x6x6 color cube plus a 24 step gray ramp.
    pub fn base() -> Palette {
        let mut colors = Vec::with_capacity(241);
        colors.push((0, 0, 0));
        const LEVELS: [u8; 6] = [0, 51, 102, 153, 204, 255];
        for r in LEVELS {
            for g in LEVELS {
                for b in LEVELS {
                    colors.push((r, g, b));
                }
            }
        }
        for i in 0..24u32 {
            let v = ((i + 1) * 255 / 25) as u8;
            colors.push((v, v, v));
        }
        match Palette::new(&colors) {
            Ok(palette) => palette,
            Err(_) => unreachable!("stock palette is always within bounds"),
        }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Packed 0xRRGGBB color of an entry.
    pub fn color(&self, index: u8) -> u32 {
        self.colors[index as usize]
    }

    pub fn rgb(&self, index: u8) -> (u8, u8, u8) {
        unpack(self.colors[index as usize])
    }
}

/// Prebuilt nearest-color answers for every 2x2x2 cell of RGB space.
///
/// Two tables share one key: the entry index for output pixels and the
/// entry's packed color for error diffusion. Memory cost is flat at
/// ~10 MiB regardless of palette size.
pub struct ColorTables {
    index: Box<[u8]>,
    rgb: Box<[u32]>,
}

impl ColorTables {
    /// Exhaustive scan of all cells, one red slice per work unit.
    pub fn build(palette: &Palette) -> ColorTables {
        let mut index = vec![0u8; TABLE_LEN].into_boxed_slice();
        let mut rgb = vec![0u32; TABLE_LEN].into_boxed_slice();

        index
            .par_chunks_mut(SLICE_LEN)
            .zip(rgb.par_chunks_mut(SLICE_LEN))
            .enumerate()
            .for_each(|(slice, (index_slice, rgb_slice))| {
                let r = (slice << 1) as i32;
                for gi in 0..KEY_SIDE {
                    let g = (gi << 1) as i32;
                    for bi in 0..KEY_SIDE {
                        let b = (bi << 1) as i32;
                        let best = find_closest(palette, r, g, b);
                        index_slice[gi * KEY_SIDE + bi] = best;
                        rgb_slice[gi * KEY_SIDE + bi] = palette.color(best);
                    }
                }
            });

        ColorTables { index, rgb }
    }

    #[inline]
    fn key(r: i32, g: i32, b: i32) -> usize {
        debug_assert!((0..256).contains(&r) && (0..256).contains(&g) && (0..256).contains(&b));
        ((r as usize >> 1) << (2 * KEY_BITS)) | ((g as usize >> 1) << KEY_BITS) | (b as usize >> 1)
    }

    /// Palette index of the entry closest to an in-range color.
    #[inline]
    pub fn nearest_index(&self, r: i32, g: i32, b: i32) -> u8 {
        self.index[Self::key(r, g, b)]
    }

    /// Closest entry as (index, packed 0xRRGGBB).
    #[inline]
    pub fn nearest(&self, r: i32, g: i32, b: i32) -> (u8, u32) {
        let key = Self::key(r, g, b);
        (self.index[key], self.rgb[key])
    }
}

#[inline]
fn pack(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

#[inline]
fn unpack(color: u32) -> (u8, u8, u8) {
    ((color >> 16) as u8, (color >> 8) as u8, color as u8)
}

/// Red-weighted squared distance. Cheap to compute and noticeably better
/// than plain Euclidean at separating dark shades.
#[inline]
fn redmean_distance(r: i32, g: i32, b: i32, pr: i32, pg: i32, pb: i32) -> i32 {
    let rmean = (r + pr) >> 1;
    let dr = r - pr;
    let dg = g - pg;
    let db = b - pb;
    (((512 + rmean) * dr * dr) >> 8) + 4 * dg * dg + (((767 - rmean) * db * db) >> 8)
}

/// Linear scan over the matchable entries. Ties keep the lowest index so
/// table construction is order independent.
fn find_closest(palette: &Palette, r: i32, g: i32, b: i32) -> u8 {
    let mut best = 1u8;
    let mut best_distance = i32::MAX;
    for index in 1..palette.len() {
        let (pr, pg, pb) = palette.rgb(index as u8);
        let distance = redmean_distance(r, g, b, pr as i32, pg as i32, pb as i32);
        if distance < best_distance {
            best_distance = distance;
            best = index as u8;
        }
    }
    best
}
