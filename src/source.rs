use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::RgbFrame;
use crate::FrameSource;

/// Static gradient with a bouncing block and a periodic scene flip, so
/// the pipeline can be exercised without real footage.
pub struct PatternSource {
    width: usize,
    height: usize,
    frames: u64,
    served: u64,
    rate: f64,
}

impl PatternSource {
    pub fn new(width: usize, height: usize, frames: u64, rate: f64) -> PatternSource {
        PatternSource {
            width,
            height,
            frames,
            served: 0,
            rate,
        }
    }
}

/// Triangle wave over 0..=span.
fn bounce(t: usize, span: usize) -> usize {
    if span == 0 {
        return 0;
    }
    let phase = t % (2 * span);
    if phase < span {
        phase
    } else {
        2 * span - phase
    }
}

impl FrameSource for PatternSource {
    fn frame_rate(&self) -> f64 {
        self.rate
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames)
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>, PipelineError> {
        if self.served >= self.frames {
            return Ok(None);
        }
        let t = self.served as usize;
        let (w, h) = (self.width, self.height);
        let mut frame = RgbFrame::new(w, h);

        // The gradient swaps axes every 150 frames, a scene cut.
        let flipped = (t / 150) % 2 == 1;
        for y in 0..h {
            for x in 0..w {
                let a = (x * 255 / w.max(1)) as u8;
                let b = (y * 255 / h.max(1)) as u8;
                let rgb = if flipped { (b, a, 96) } else { (a, b, 96) };
                frame.set_pixel(x, y, rgb);
            }
        }

        // A bright block bouncing at unequal x and y rates.
        let side = (h / 6).max(1);
        let bx = bounce(t * 7, w.saturating_sub(side));
        let by = bounce(t * 5, h.saturating_sub(side));
        for y in by..(by + side).min(h) {
            for x in bx..(bx + side).min(w) {
                frame.set_pixel(x, y, (255, 255, 255));
            }
        }

        self.served += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
        self.served = frame.min(self.frames);
        Ok(())
    }
}

/// Plays the png/jpeg files of a directory in name order at a fixed rate.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    cursor: usize,
    rate: f64,
}

impl ImageDirSource {
    pub fn open(dir: &Path, rate: f64) -> Result<ImageDirSource, PipelineError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| PipelineError::source(format!("reading {}: {err}", dir.display())))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("png" | "jpg" | "jpeg")
                )
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(PipelineError::source(format!(
                "no png or jpeg frames in {}",
                dir.display()
            )));
        }
        Ok(ImageDirSource {
            paths,
            cursor: 0,
            rate,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn frame_rate(&self) -> f64 {
        self.rate
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>, PipelineError> {
        let path = match self.paths.get(self.cursor) {
            Some(path) => path.clone(),
            None => return Ok(None),
        };
        self.cursor += 1;
        let decoded = image::open(&path)
            .map_err(|err| PipelineError::source(format!("{}: {err}", path.display())))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        let frame = RgbFrame::from_raw(width as usize, height as usize, decoded.into_raw())?;
        Ok(Some(frame))
    }

    fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
        self.cursor = (frame as usize).min(self.paths.len());
        Ok(())
    }
}
