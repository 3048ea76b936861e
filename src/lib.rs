pub mod config;
pub mod dispatch;
pub mod dither;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod palette;
pub mod player;
pub mod processor;
pub mod screen;
pub mod source;

use crate::error::PipelineError;
use crate::frame::RgbFrame;

/// Anything that can hand the player decoded RGB frames in order.
pub trait FrameSource: Send {
    /// Nominal frames per second; drives the delivery clock.
    fn frame_rate(&self) -> f64;

    /// Total frames when known ahead of time.
    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Next frame, `Ok(None)` once the stream ends. An error skips the
    /// frame, it does not end playback.
    fn next_frame(&mut self) -> Result<Option<RgbFrame>, PipelineError>;

    /// Jump so the next `next_frame` returns the given frame.
    fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
        let _ = frame;
        Err(PipelineError::SeekUnsupported)
    }
}
