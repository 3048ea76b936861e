/// Unified error type for the tile streaming pipeline.
///
/// Construction failures (palette, config, screen geometry) are fatal and
/// surface before any frame is accepted; per-frame failures are recoverable
/// and only skip the cycle they occurred in.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("palette error: {0}")]
    Palette(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("screen error: {0}")]
    Screen(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("seek is not supported by this source")]
    SeekUnsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn palette<T: ToString>(msg: T) -> Self {
        PipelineError::Palette(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        PipelineError::Config(msg.to_string())
    }

    pub fn frame<T: ToString>(msg: T) -> Self {
        PipelineError::Frame(msg.to_string())
    }

    pub fn screen<T: ToString>(msg: T) -> Self {
        PipelineError::Screen(msg.to_string())
    }

    pub fn source<T: ToString>(msg: T) -> Self {
        PipelineError::Source(msg.to_string())
    }

    /// True for errors that abort a single cycle rather than the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Frame(_) | PipelineError::Source(_) | PipelineError::SeekUnsupported
        )
    }
}
