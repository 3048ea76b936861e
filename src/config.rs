use bitflags::bitflags;

use crate::dither::DitherMode;
use crate::error::PipelineError;

bitflags! {
    /// Toggles for the dispatcher's optional reduction passes.
    ///
    ///  7  bit  0
    ///  ---- ----
    ///  .... .BSE
    ///        ||+- Entropy filter: drop low-variety fresh regions
    ///        |+-- Spatial downsample: checkerboard-defer small fresh changes
    ///        +--- Bundled transport: one cycle arrives atomically
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchFlags: u8 {
        const ENTROPY_FILTER = 0b0000_0001;
        const SPATIAL_DOWNSAMPLE = 0b0000_0010;
        const BUNDLE = 0b0000_0100;
    }
}

/// Settings for the dither engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DitherConfig {
    pub mode: DitherMode,
    /// Color deltas at or below this magnitude sum do not diffuse. The
    /// sum spans all three channels, so the useful range is 0 to 765.
    pub error_threshold: u16,
    /// Reuse the previous frame's output for visually static pixels.
    pub temporal: bool,
    /// Per-channel tolerance for temporal reuse.
    pub temporal_threshold: u8,
    /// Low bits masked off diffused error, 0 to 7.
    pub error_quant_bits: u8,
}

impl Default for DitherConfig {
    fn default() -> DitherConfig {
        DitherConfig {
            mode: DitherMode::ErrorDiffusion { strength: 0.8 },
            error_threshold: 4,
            temporal: true,
            temporal_threshold: 4,
            error_quant_bits: 2,
        }
    }
}

impl DitherConfig {
    /// Clamp out-of-range fields instead of rejecting them, the way the
    /// stream settings loader always has.
    pub fn normalized(mut self) -> DitherConfig {
        if let DitherMode::ErrorDiffusion { strength } = self.mode {
            self.mode = DitherMode::ErrorDiffusion {
                strength: strength.clamp(0.0, 1.0),
            };
        }
        self.error_quant_bits = self.error_quant_bits.min(7);
        self
    }
}

/// Thresholds for per-tile change detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Fewer changed pixels than this is noise unless deferrals accumulate.
    pub min_changed_pixels: u32,
    /// Changed pixels per tile pixel below this is noise as well.
    pub min_change_density: f32,
    /// Bounding box share of the tile above which a full send is considered.
    pub full_tile_area: f32,
    /// Change density above which a dominating box becomes a full send.
    pub full_tile_density: f32,
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            min_changed_pixels: 16,
            min_change_density: 0.002,
            full_tile_area: 0.7,
            full_tile_density: 0.5,
        }
    }
}

/// Budget and banding policy for the update dispatcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchConfig {
    pub flags: DispatchFlags,
    /// Payload bytes allowed per cycle before updates defer.
    pub byte_budget: usize,
    /// Transport message rate the per-cycle cap is derived from.
    pub messages_per_second: u32,
    /// Floor for the derived per-cycle message cap.
    pub min_messages_per_cycle: u32,
    /// Tiles with a major change, as a fraction of all tiles, that flips a
    /// cycle into scene-change handling.
    pub scene_change_fraction: f32,
    /// Fraction of a tile that must change for the tile to count as major.
    pub major_change_fraction: f32,
    /// Byte budget multiplier while a scene change is being absorbed.
    pub scene_byte_boost: f32,
    /// Message cap multiplier while a scene change is being absorbed.
    pub scene_message_boost: f32,
    /// Cycles the relaxed budgets persist across an unbundled scene cut,
    /// counting the cut cycle itself.
    pub scene_hold_cycles: u32,
    /// Weight of each staleness step in the priority score.
    pub staleness_weight: u32,
    /// Staleness saturates at this many cycles inside the score.
    pub staleness_cap: u32,
    /// Deferral count at which a tile becomes critical.
    pub critical_staleness: u32,
    /// Regions smaller than this stay in the low band while fresh.
    pub min_region_pixels: u32,
    /// Unique colors a fresh region needs to pass the entropy filter.
    pub min_unique_colors: u32,
}

impl Default for DispatchConfig {
    fn default() -> DispatchConfig {
        DispatchConfig {
            flags: DispatchFlags::ENTROPY_FILTER | DispatchFlags::SPATIAL_DOWNSAMPLE,
            byte_budget: 10 * 1024 * 1024,
            messages_per_second: 1800,
            min_messages_per_cycle: 4,
            scene_change_fraction: 0.6,
            major_change_fraction: 0.5,
            scene_byte_boost: 1.25,
            scene_message_boost: 1.3,
            scene_hold_cycles: 2,
            staleness_weight: 500,
            staleness_cap: 5,
            critical_staleness: 3,
            min_region_pixels: 32,
            min_unique_colors: 3,
        }
    }
}

impl DispatchConfig {
    /// Reject budgets that could never drain a single tile. The starvation
    /// bound on stale tiles only holds if one full tile always fits.
    pub fn validate(&self, tile_area: usize) -> Result<(), PipelineError> {
        if self.byte_budget < tile_area {
            return Err(PipelineError::config(format!(
                "byte budget {} is below one full tile ({} bytes)",
                self.byte_budget, tile_area
            )));
        }
        if self.messages_per_second == 0 {
            return Err(PipelineError::config("messages_per_second must be nonzero"));
        }
        if self.min_messages_per_cycle == 0 {
            return Err(PipelineError::config(
                "min_messages_per_cycle must be nonzero",
            ));
        }
        if !(0.0..=1.0).contains(&self.scene_change_fraction) {
            return Err(PipelineError::config(
                "scene_change_fraction must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.major_change_fraction) {
            return Err(PipelineError::config(
                "major_change_fraction must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}
