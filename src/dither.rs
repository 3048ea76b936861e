use std::sync::Arc;

use crate::config::DitherConfig;
use crate::frame::RgbFrame;
use crate::palette::ColorTables;

/// How quantization error is shaped across the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DitherMode {
    /// Straight nearest-color lookup.
    None,
    /// Position-based threshold from an 8x8 Bayer matrix.
    Ordered,
    /// Serpentine Floyd-Steinberg diffusion, strength 0.0 to 1.0.
    ErrorDiffusion { strength: f32 },
}

/// Classic 8x8 Bayer matrix, entries 0..64.
const BAYER_8X8: [[i32; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Converts RGB frames into palette index canvases.
///
/// Holds the previous frame's output and per-pixel source hashes so the
/// diffusion path can hand back last frame's pixel when the source has not
/// visibly moved. That reuse is what keeps flat areas from shimmering
/// frame to frame.
pub struct Ditherer {
    tables: Arc<ColorTables>,
    cfg: DitherConfig,
    width: usize,
    height: usize,
    canvas: Box<[u8]>,
    prev_output: Box<[u8]>,
    prev_hash: Box<[u32]>,
    err_current: Box<[i32]>,
    err_next: Box<[i32]>,
    reused: u64,
}

impl Ditherer {
    pub fn new(tables: Arc<ColorTables>, cfg: DitherConfig) -> Ditherer {
        Ditherer {
            tables,
            cfg: cfg.normalized(),
            width: 0,
            height: 0,
            canvas: Box::new([]),
            prev_output: Box::new([]),
            prev_hash: Box::new([]),
            err_current: Box::new([]),
            err_next: Box::new([]),
            reused: 0,
        }
    }

    /// Quantize one frame. The returned slice is one palette index per
    /// pixel in row-major order, valid until the next call.
    pub fn dither(&mut self, frame: &RgbFrame) -> &[u8] {
        self.ensure_size(frame.width(), frame.height());
        self.reused = 0;
        match self.cfg.mode {
            DitherMode::None => self.render_flat(frame),
            DitherMode::Ordered => self.render_ordered(frame),
            DitherMode::ErrorDiffusion { strength } => self.render_diffused(frame, strength),
        }
        &self.canvas
    }

    pub fn canvas(&self) -> &[u8] {
        &self.canvas
    }

    /// Pixels served from the previous frame during the last `dither` call.
    pub fn reused_pixels(&self) -> u64 {
        self.reused
    }

    fn ensure_size(&mut self, width: usize, height: usize) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        let pixels = width * height;
        self.canvas = vec![0u8; pixels].into_boxed_slice();
        self.prev_output = vec![0u8; pixels].into_boxed_slice();
        self.prev_hash = vec![0u32; pixels].into_boxed_slice();
        self.err_current = vec![0i32; width * 3].into_boxed_slice();
        self.err_next = vec![0i32; width * 3].into_boxed_slice();
    }

    fn render_flat(&mut self, frame: &RgbFrame) {
        let data = frame.data();
        for (pixel, out) in self.canvas.iter_mut().enumerate() {
            let src = pixel * 3;
            *out = self
                .tables
                .nearest_index(data[src] as i32, data[src + 1] as i32, data[src + 2] as i32);
        }
    }

    fn render_ordered(&mut self, frame: &RgbFrame) {
        let data = frame.data();
        let width = self.width;
        for (pixel, out) in self.canvas.iter_mut().enumerate() {
            let x = pixel % width;
            let y = pixel / width;
            let threshold = BAYER_8X8[y & 7][x & 7] * 4 - 128;
            let src = pixel * 3;
            let r = clamp_channel(data[src] as i32 + threshold);
            let g = clamp_channel(data[src + 1] as i32 + threshold);
            let b = clamp_channel(data[src + 2] as i32 + threshold);
            *out = self.tables.nearest_index(r, g, b);
        }
    }

    fn render_diffused(&mut self, frame: &RgbFrame, strength: f32) {
        let Ditherer {
            tables,
            cfg,
            width,
            height,
            canvas,
            prev_output,
            prev_hash,
            err_current,
            err_next,
            reused,
        } = self;
        let width = *width;
        let height = *height;
        let data = frame.data();

        let strength_fixed = (strength * 256.0) as i32;
        let error_threshold = cfg.error_threshold as i32;
        let quant_mask: i32 = if cfg.error_quant_bits > 0 {
            -(1 << cfg.error_quant_bits)
        } else {
            0
        };
        let temporal = cfg.temporal;
        let tolerance = cfg.temporal_threshold as i32;
        let bucket = (tolerance * 2).max(1);

        err_current.fill(0);
        err_next.fill(0);

        for y in 0..height {
            // The row that accumulated error below us becomes current.
            std::mem::swap(err_current, err_next);
            err_next.fill(0);

            let has_next_row = y + 1 < height;
            let forward = y & 1 == 0;
            let row = y * width;

            for step in 0..width {
                let x = if forward { step } else { width - 1 - step };
                let pixel = row + x;
                let src = pixel * 3;
                let buf = x * 3;

                let r = clamp_channel(data[src] as i32 + err_current[buf]);
                let g = clamp_channel(data[src + 1] as i32 + err_current[buf + 1]);
                let b = clamp_channel(data[src + 2] as i32 + err_current[buf + 2]);

                if temporal {
                    let hash = ((r / bucket) as u32) << 16
                        | ((g / bucket) as u32) << 8
                        | (b / bucket) as u32;
                    let hash = hash + 1;
                    let prev = prev_hash[pixel];
                    let reuse = if prev == hash {
                        true
                    } else if prev != 0 {
                        let decoded = prev - 1;
                        let pr = ((decoded >> 16) & 0xFF) as i32 * bucket;
                        let pg = ((decoded >> 8) & 0xFF) as i32 * bucket;
                        let pb = (decoded & 0xFF) as i32 * bucket;
                        (r - pr).abs() <= tolerance
                            && (g - pg).abs() <= tolerance
                            && (b - pb).abs() <= tolerance
                    } else {
                        false
                    };
                    if reuse {
                        // Keep last frame's pixel and diffuse nothing.
                        canvas[pixel] = prev_output[pixel];
                        *reused += 1;
                        continue;
                    }
                    prev_hash[pixel] = hash;
                }

                let (index, rgb) = tables.nearest(r, g, b);
                canvas[pixel] = index;

                let mut dr = r - ((rgb >> 16) & 0xFF) as i32;
                let mut dg = g - ((rgb >> 8) & 0xFF) as i32;
                let mut db = b - (rgb & 0xFF) as i32;

                if dr.abs() + dg.abs() + db.abs() <= error_threshold {
                    continue;
                }
                // Mask before scaling: the coarse error buckets are in
                // source units, not post-strength units.
                if quant_mask != 0 {
                    dr &= quant_mask;
                    dg &= quant_mask;
                    db &= quant_mask;
                }
                dr = (dr * strength_fixed) >> 8;
                dg = (dg * strength_fixed) >> 8;
                db = (db * strength_fixed) >> 8;

                let ahead_ok = if forward { x + 1 < width } else { x > 0 };
                let behind_ok = if forward { x > 0 } else { x + 1 < width };
                if ahead_ok {
                    let o = if forward { buf + 3 } else { buf - 3 };
                    err_current[o] += (dr * 7) >> 4;
                    err_current[o + 1] += (dg * 7) >> 4;
                    err_current[o + 2] += (db * 7) >> 4;
                }
                if has_next_row {
                    if behind_ok {
                        let o = if forward { buf - 3 } else { buf + 3 };
                        err_next[o] += (dr * 3) >> 4;
                        err_next[o + 1] += (dg * 3) >> 4;
                        err_next[o + 2] += (db * 3) >> 4;
                    }
                    err_next[buf] += (dr * 5) >> 4;
                    err_next[buf + 1] += (dg * 5) >> 4;
                    err_next[buf + 2] += (db * 5) >> 4;
                    if ahead_ok {
                        let o = if forward { buf + 3 } else { buf - 3 };
                        err_next[o] += dr >> 4;
                        err_next[o + 1] += dg >> 4;
                        err_next[o + 2] += db >> 4;
                    }
                }
            }
        }

        prev_output.copy_from_slice(canvas);
    }
}

/// Clamp to 0..=255 with a single branch in the common case.
#[inline]
fn clamp_channel(v: i32) -> i32 {
    if v & !0xFF != 0 {
        if v < 0 {
            0
        } else {
            255
        }
    } else {
        v
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::OnceLock;

    use super::*;
    use crate::palette::Palette;

    fn mono_tables() -> Arc<ColorTables> {
        static MONO_TABLES: OnceLock<Arc<ColorTables>> = OnceLock::new();
        MONO_TABLES
            .get_or_init(|| {
                // Reserved slot, black at 1, white at 2.
                let palette =
                    Palette::new(&[(0, 0, 0), (0, 0, 0), (255, 255, 255)]).unwrap();
                Arc::new(ColorTables::build(&palette))
            })
            .clone()
    }

    fn cfg(mode: DitherMode) -> DitherConfig {
        DitherConfig {
            mode,
            error_threshold: 4,
            temporal: false,
            temporal_threshold: 4,
            error_quant_bits: 0,
        }
    }

    fn solid(width: usize, height: usize, v: u8) -> RgbFrame {
        crate::frame::test::solid(width, height, (v, v, v))
    }

    #[test]
    fn clamp_channel_is_exact() {
        assert_eq!(clamp_channel(-1), 0);
        assert_eq!(clamp_channel(-500), 0);
        assert_eq!(clamp_channel(0), 0);
        assert_eq!(clamp_channel(128), 128);
        assert_eq!(clamp_channel(255), 255);
        assert_eq!(clamp_channel(256), 255);
        assert_eq!(clamp_channel(9999), 255);
    }

    #[test]
    fn flat_mode_maps_solid_frames_to_one_index() {
        let mut ditherer = Ditherer::new(mono_tables(), cfg(DitherMode::None));
        let canvas = ditherer.dither(&solid(16, 8, 250));
        assert_eq!(canvas.len(), 16 * 8);
        assert!(canvas.iter().all(|&i| i == 2));

        let canvas = ditherer.dither(&solid(16, 8, 5));
        assert!(canvas.iter().all(|&i| i == 1));
    }

    #[test]
    fn flat_mode_is_idempotent_on_quantized_content() {
        let mut ditherer = Ditherer::new(mono_tables(), cfg(DitherMode::None));
        let mut frame = RgbFrame::new(8, 4);
        for y in 0..4 {
            for x in 0..8 {
                let v = if (x + y) % 2 == 0 { 0 } else { 255 };
                frame.set_pixel(x, y, (v, v, v));
            }
        }
        let first = ditherer.dither(&frame).to_vec();

        // Decode the canvas back to RGB and render it again: a frame of
        // pure palette colors must come out unchanged.
        let mut decoded = RgbFrame::new(8, 4);
        for y in 0..4 {
            for x in 0..8 {
                let v = if first[y * 8 + x] == 2 { 255 } else { 0 };
                decoded.set_pixel(x, y, (v, v, v));
            }
        }
        assert_eq!(ditherer.dither(&decoded), &first[..]);
    }

    #[test]
    fn ordered_mode_follows_the_bayer_matrix() {
        let tables = mono_tables();
        let mut ditherer = Ditherer::new(tables.clone(), cfg(DitherMode::Ordered));
        let width = 16;
        let canvas = ditherer.dither(&solid(width, 16, 128)).to_vec();

        for y in 0..16 {
            for x in 0..width {
                let threshold = BAYER_8X8[y & 7][x & 7] * 4 - 128;
                let adjusted = clamp_channel(128 + threshold);
                let want = tables.nearest_index(adjusted, adjusted, adjusted);
                assert_eq!(canvas[y * width + x], want, "at ({x},{y})");
            }
        }
        // Matrix corners: 0 drives the pixel black, 63 drives it white.
        assert_eq!(canvas[0], 1);
        assert_eq!(canvas[7 * width], 2);
        assert!(canvas.contains(&1) && canvas.contains(&2));
    }

    #[test]
    fn diffusion_carries_error_to_the_right_neighbor() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut ditherer = Ditherer::new(mono_tables(), cfg(mode));
        // 128 quantizes to white; the -127 error scaled by 7/16 pulls the
        // next pixel down to 72, which quantizes black.
        let canvas = ditherer.dither(&solid(2, 1, 128));
        assert_eq!(canvas, &[2, 1]);
    }

    #[test]
    fn diffusion_balances_gray_toward_half_white() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut config = cfg(mode);
        config.error_threshold = 0;
        let mut ditherer = Ditherer::new(mono_tables(), config);
        let canvas = ditherer.dither(&solid(64, 64, 128));
        let white = canvas.iter().filter(|&&i| i == 2).count();
        let fraction = white as f64 / canvas.len() as f64;
        assert!(
            (0.4..=0.6).contains(&fraction),
            "white fraction {fraction} is off for mid gray"
        );
    }

    #[test]
    fn large_error_threshold_disables_diffusion() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut config = cfg(mode);
        // Mid gray leaves |delta| summing to 381; a higher threshold
        // swallows it and every pixel quantizes alone.
        config.error_threshold = 400;
        let mut ditherer = Ditherer::new(mono_tables(), config);
        let canvas = ditherer.dither(&solid(8, 8, 128));
        assert_eq!(canvas, &[2u8; 64][..], "128 alone quantizes white");
    }

    #[test]
    fn quantized_error_can_flip_a_boundary_pixel() {
        // 201 quantizes white with error -54. Unquantized the neighbor
        // share is -24 and 152 lands on 128 (white); with two bits masked
        // the error becomes -56, the share -25, and 127 goes black.
        let mut frame = RgbFrame::new(2, 1);
        frame.set_pixel(0, 0, (201, 201, 201));
        frame.set_pixel(1, 0, (152, 152, 152));
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };

        let mut ditherer = Ditherer::new(mono_tables(), cfg(mode));
        assert_eq!(ditherer.dither(&frame), &[2, 2]);

        let mut config = cfg(mode);
        config.error_quant_bits = 2;
        let mut ditherer = Ditherer::new(mono_tables(), config);
        assert_eq!(ditherer.dither(&frame), &[2, 1]);
    }

    #[test]
    fn error_mask_applies_before_strength_scaling() {
        // 205 quantizes white with error -50. Masking two bits first gives
        // -52, halved to -26, a -12 carry: the neighbor stays at 128 and
        // goes white. Scaling first would hand the mask -25, widen it to
        // -28 and push the neighbor to 127, black.
        let mut frame = RgbFrame::new(2, 1);
        frame.set_pixel(0, 0, (205, 205, 205));
        frame.set_pixel(1, 0, (140, 140, 140));
        let mode = DitherMode::ErrorDiffusion { strength: 0.5 };
        let mut config = cfg(mode);
        config.error_quant_bits = 2;
        let mut ditherer = Ditherer::new(mono_tables(), config);
        assert_eq!(ditherer.dither(&frame), &[2, 2]);
    }

    #[test]
    fn strength_halves_the_diffused_share() {
        let mut frame = RgbFrame::new(2, 1);
        frame.set_pixel(0, 0, (201, 201, 201));
        frame.set_pixel(1, 0, (140, 140, 140));

        let full = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut ditherer = Ditherer::new(mono_tables(), cfg(full));
        // Share -24 drags 140 to 116, black.
        assert_eq!(ditherer.dither(&frame), &[2, 1]);

        let half = DitherMode::ErrorDiffusion { strength: 0.5 };
        let mut ditherer = Ditherer::new(mono_tables(), cfg(half));
        // Share -12 leaves 128, white.
        assert_eq!(ditherer.dither(&frame), &[2, 2]);
    }

    #[test]
    fn zero_strength_diffusion_matches_flat_mode() {
        let mut frame = RgbFrame::new(16, 4);
        for y in 0..4 {
            for x in 0..16 {
                let v = (x * 16) as u8;
                frame.set_pixel(x, y, (v, v, v));
            }
        }
        let mut flat = Ditherer::new(mono_tables(), cfg(DitherMode::None));
        let zero = DitherMode::ErrorDiffusion { strength: 0.0 };
        let mut scaled = Ditherer::new(mono_tables(), cfg(zero));
        // Nothing carries at strength zero, so the serpentine path
        // degenerates to a plain lookup.
        assert_eq!(flat.dither(&frame), scaled.dither(&frame));
    }

    #[test]
    fn temporal_reuse_covers_static_palette_content() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut config = cfg(mode);
        config.temporal = true;
        let mut ditherer = Ditherer::new(mono_tables(), config);

        // Exact palette colors leave no error, so the second pass sees
        // identical adjusted values everywhere.
        let mut frame = RgbFrame::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                let v = if (x + y) % 2 == 0 { 0 } else { 255 };
                frame.set_pixel(x, y, (v, v, v));
            }
        }

        let first = ditherer.dither(&frame).to_vec();
        assert_eq!(ditherer.reused_pixels(), 0);
        let second = ditherer.dither(&frame).to_vec();
        assert_eq!(first, second);
        assert_eq!(ditherer.reused_pixels(), 64);
    }

    #[test]
    fn temporal_tolerance_absorbs_small_wobble() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut config = cfg(mode);
        config.temporal = true;
        config.temporal_threshold = 4;
        let mut ditherer = Ditherer::new(mono_tables(), config);

        // Exact black leaves no diffusion residue to disturb the hashes.
        ditherer.dither(&solid(8, 8, 0));
        // A two step wobble stays inside the tolerance everywhere.
        ditherer.dither(&solid(8, 8, 2));
        assert_eq!(ditherer.reused_pixels(), 64);

        // A ten step jump falls outside both the bucket and the tolerance.
        ditherer.dither(&solid(8, 8, 10));
        assert_eq!(ditherer.reused_pixels(), 0);
    }

    #[test]
    fn temporal_off_never_reuses() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut ditherer = Ditherer::new(mono_tables(), cfg(mode));
        let frame = solid(8, 8, 200);
        ditherer.dither(&frame);
        ditherer.dither(&frame);
        assert_eq!(ditherer.reused_pixels(), 0);
    }

    #[test]
    fn resize_resets_state() {
        let mode = DitherMode::ErrorDiffusion { strength: 1.0 };
        let mut config = cfg(mode);
        config.temporal = true;
        let mut ditherer = Ditherer::new(mono_tables(), config);

        ditherer.dither(&solid(8, 8, 250));
        ditherer.dither(&solid(4, 4, 250));
        // Fresh buffers for the new geometry, nothing to reuse yet.
        assert_eq!(ditherer.reused_pixels(), 0);
        assert_eq!(ditherer.canvas().len(), 16);
    }
}
