use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::config::{DispatchConfig, DitherConfig, TrackerConfig};
use crate::dispatch::{Dispatcher, PatchBatch};
use crate::dither::Ditherer;
use crate::error::PipelineError;
use crate::frame::RgbFrame;
use crate::metrics::PipelineMetrics;
use crate::palette::ColorTables;
use crate::screen::tile::{Tile, TileDiff, TilePatch};
use crate::screen::Screen;

/// Tile counts below this are cheaper to extract on one thread.
const PARALLEL_TILE_THRESHOLD: usize = 64;
/// Canvases above this many pixels upscale on the thread pool.
const PARALLEL_UPSCALE_PIXELS: usize = 1_000_000;
/// Rows handed to each worker during parallel upscale.
const UPSCALE_CHUNK_ROWS: usize = 64;

/// One tile's worth of a processed frame.
#[derive(Debug, Clone)]
pub struct TileUpdate {
    /// Tile index within the screen.
    pub tile: usize,
    pub diff: TileDiff,
    /// Full tile pixels, kept alongside the diff for commits and snapshots.
    pub data: Box<[u8]>,
}

/// Turns raw frames into per-tile updates: letterbox, scale, dither,
/// slice, diff.
pub struct FrameProcessor {
    ditherer: Ditherer,
    tracker: TrackerConfig,
    upscaled: Vec<u8>,
}

impl FrameProcessor {
    pub fn new(tables: Arc<ColorTables>, dither: DitherConfig, tracker: TrackerConfig) -> FrameProcessor {
        FrameProcessor {
            ditherer: Ditherer::new(tables, dither),
            tracker,
            upscaled: Vec::new(),
        }
    }

    pub fn process(
        &mut self,
        frame: &RgbFrame,
        screen: &Screen,
        metrics: &mut PipelineMetrics,
    ) -> Result<Vec<TileUpdate>, PipelineError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(PipelineError::frame("cannot process an empty frame"));
        }
        let target_width = screen.pixel_width();
        let target_height = screen.pixel_height();

        // Shrinking happens in RGB before quantization where detail still
        // exists; growing happens after, on cheap palette indices.
        let t = Instant::now();
        let boxed = frame.letterboxed(target_width, target_height);
        let source = boxed.as_ref().unwrap_or(frame);
        let reduced;
        let source = if source.width() > target_width || source.height() > target_height {
            reduced = source.resized_bilinear(target_width, target_height);
            &reduced
        } else {
            source
        };
        metrics.resample.record(t.elapsed());

        let FrameProcessor {
            ditherer,
            tracker,
            upscaled,
        } = self;

        let t = Instant::now();
        ditherer.dither(source);
        metrics.dither.record(t.elapsed());
        metrics.record_stability(
            ditherer.reused_pixels(),
            (source.width() * source.height()) as u64,
        );

        let canvas: &[u8] = if source.width() != target_width || source.height() != target_height
        {
            let t = Instant::now();
            upscale_indices(
                ditherer.canvas(),
                source.width(),
                source.height(),
                target_width,
                target_height,
                upscaled,
            );
            metrics.upscale.record(t.elapsed());
            upscaled
        } else {
            ditherer.canvas()
        };

        let t = Instant::now();
        let updates: Vec<TileUpdate> = if screen.tile_count() >= PARALLEL_TILE_THRESHOLD {
            screen
                .tiles()
                .par_iter()
                .map(|tile| build_update(canvas, target_width, tile, tracker))
                .collect()
        } else {
            screen
                .tiles()
                .iter()
                .map(|tile| build_update(canvas, target_width, tile, tracker))
                .collect()
        };
        metrics.extract.record(t.elapsed());
        Ok(updates)
    }
}

fn build_update(canvas: &[u8], canvas_width: usize, tile: &Tile, cfg: &TrackerConfig) -> TileUpdate {
    let data = extract_tile(canvas, canvas_width, tile);
    let diff = tile.diff(&data, cfg);
    TileUpdate {
        tile: tile.index(),
        diff,
        data,
    }
}

/// Copy one tile's rows out of the full canvas.
fn extract_tile(canvas: &[u8], canvas_width: usize, tile: &Tile) -> Box<[u8]> {
    let side = tile.side();
    let base_x = tile.tile_x() as usize * side;
    let base_y = tile.tile_y() as usize * side;
    let mut data = vec![0u8; side * side];
    for row in 0..side {
        let src = (base_y + row) * canvas_width + base_x;
        data[row * side..(row + 1) * side].copy_from_slice(&canvas[src..src + side]);
    }
    data.into_boxed_slice()
}

/// Nearest-neighbor upscale of palette indices.
///
/// Source columns are precomputed once per call, repeated target rows are
/// block copies of the first rendering, and exact integer ratios up to 8x
/// take a fill-based fast path.
fn upscale_indices(
    src: &[u8],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    out: &mut Vec<u8>,
) {
    out.clear();
    out.resize(dst_width * dst_height, 0);
    if src_width == dst_width && src_height == dst_height {
        out.copy_from_slice(src);
        return;
    }

    let src_x: Vec<usize> = (0..dst_width).map(|x| x * src_width / dst_width).collect();

    if dst_width * dst_height > PARALLEL_UPSCALE_PIXELS {
        out.par_chunks_mut(dst_width * UPSCALE_CHUNK_ROWS)
            .enumerate()
            .for_each(|(chunk_index, chunk)| {
                let first_row = chunk_index * UPSCALE_CHUNK_ROWS;
                let rows = chunk.len() / dst_width;
                let mut last_sy = usize::MAX;
                let mut last_off = 0usize;
                for r in 0..rows {
                    let sy = (first_row + r) * src_height / dst_height;
                    let off = r * dst_width;
                    if sy == last_sy {
                        chunk.copy_within(last_off..last_off + dst_width, off);
                    } else {
                        let src_off = sy * src_width;
                        for (dx, &sx) in src_x.iter().enumerate() {
                            chunk[off + dx] = src[src_off + sx];
                        }
                        last_sy = sy;
                        last_off = off;
                    }
                }
            });
        return;
    }

    let scale_x = dst_width / src_width.max(1);
    let scale_y = dst_height / src_height.max(1);
    let integer_scale = scale_x >= 1
        && scale_x == scale_y
        && scale_x <= 8
        && dst_width == src_width * scale_x
        && dst_height == src_height * scale_y;
    if integer_scale {
        for sy in 0..src_height {
            let src_row = &src[sy * src_width..(sy + 1) * src_width];
            let dst_start = sy * scale_y * dst_width;
            {
                let row = &mut out[dst_start..dst_start + dst_width];
                for (sx, &p) in src_row.iter().enumerate() {
                    row[sx * scale_x..(sx + 1) * scale_x].fill(p);
                }
            }
            for repeat in 1..scale_y {
                out.copy_within(dst_start..dst_start + dst_width, dst_start + repeat * dst_width);
            }
        }
        return;
    }

    let mut last_sy = usize::MAX;
    let mut last_start = 0usize;
    for dy in 0..dst_height {
        let sy = dy * src_height / dst_height;
        let start = dy * dst_width;
        if sy == last_sy {
            out.copy_within(last_start..last_start + dst_width, start);
        } else {
            let src_off = sy * src_width;
            for (dx, &sx) in src_x.iter().enumerate() {
                out[start + dx] = src[src_off + sx];
            }
            last_sy = sy;
            last_start = start;
        }
    }
}

/// Processor, dispatcher, and screen wired together; one call per frame.
pub struct Pipeline {
    processor: FrameProcessor,
    dispatcher: Dispatcher,
    screen: Screen,
    metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn new(
        screen: Screen,
        tables: Arc<ColorTables>,
        dither: DitherConfig,
        tracker: TrackerConfig,
        dispatch: DispatchConfig,
    ) -> Result<Pipeline, PipelineError> {
        let dispatcher = Dispatcher::new(dispatch, screen.tile_area())?;
        Ok(Pipeline {
            processor: FrameProcessor::new(tables, dither, tracker),
            dispatcher,
            screen,
            metrics: PipelineMetrics::default(),
        })
    }

    /// Process and dispatch one frame.
    pub fn run_cycle(&mut self, frame: &RgbFrame) -> Result<PatchBatch, PipelineError> {
        let start = Instant::now();
        let updates = self
            .processor
            .process(frame, &self.screen, &mut self.metrics)?;

        let t = Instant::now();
        let batch = self.dispatcher.dispatch(&mut self.screen, updates);
        self.metrics.dispatch.record(t.elapsed());

        self.metrics.record_batch(
            batch.patches.len(),
            batch.sent_bytes,
            batch.deferred_updates,
            batch.scene_change,
        );
        self.metrics.cycle.record(start.elapsed());
        self.metrics.frames_processed += 1;
        Ok(batch)
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut PipelineMetrics {
        &mut self.metrics
    }

    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.dispatcher.set_frame_rate(frame_rate);
    }

    /// Current content for a late joiner.
    pub fn snapshot(&self) -> Vec<TilePatch> {
        self.screen.snapshot()
    }

    /// Paint the whole screen one color, bypassing budgets.
    pub fn fill(&mut self, color: u8) -> Vec<TilePatch> {
        self.screen.fill(color)
    }

    /// Force full resends on the next cycle.
    pub fn invalidate_all(&mut self) {
        self.screen.invalidate_all();
    }
}
