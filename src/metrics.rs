use std::fmt;
use std::time::Duration;

/// Last and decaying-average duration of one pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimes {
    pub last_us: u64,
    pub avg_us: u64,
}

impl StageTimes {
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.last_us = us;
        self.avg_us = if self.avg_us == 0 {
            us
        } else {
            (self.avg_us * 9 + us) / 10
        };
    }
}

/// Counters and timings accumulated across cycles.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub source: StageTimes,
    pub resample: StageTimes,
    pub dither: StageTimes,
    pub upscale: StageTimes,
    pub extract: StageTimes,
    pub dispatch: StageTimes,
    pub cycle: StageTimes,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub patches_sent: u64,
    pub bytes_sent: u64,
    pub updates_deferred: u64,
    pub scene_changes: u64,
    pub last_patches: usize,
    pub last_bytes: usize,
    pub last_deferred: usize,
    /// Share of pixels served from the previous frame, 0.0 to 1.0.
    pub temporal_stability: f32,
}

impl PipelineMetrics {
    pub fn record_batch(&mut self, patches: usize, bytes: usize, deferred: usize, scene: bool) {
        self.patches_sent += patches as u64;
        self.bytes_sent += bytes as u64;
        self.updates_deferred += deferred as u64;
        if scene {
            self.scene_changes += 1;
        }
        self.last_patches = patches;
        self.last_bytes = bytes;
        self.last_deferred = deferred;
    }

    pub fn record_stability(&mut self, reused: u64, total: u64) {
        self.temporal_stability = if total == 0 {
            0.0
        } else {
            reused as f32 / total as f32
        };
    }
}

impl fmt::Display for PipelineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames {} (skipped {}) | cycle {}us avg | dither {}us | extract {}us | \
             dispatch {}us | patches {} ({} B) deferred {} | scenes {} | stable {:.0}%",
            self.frames_processed,
            self.frames_skipped,
            self.cycle.avg_us,
            self.dither.avg_us,
            self.extract.avg_us,
            self.dispatch.avg_us,
            self.patches_sent,
            self.bytes_sent,
            self.updates_deferred,
            self.scene_changes,
            self.temporal_stability * 100.0
        )
    }
}
