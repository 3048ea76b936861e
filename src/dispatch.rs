use log::debug;

use crate::config::{DispatchConfig, DispatchFlags};
use crate::error::PipelineError;
use crate::processor::TileUpdate;
use crate::screen::tile::{DirtyRegion, TileDiff, TileHandle, TilePatch};
use crate::screen::Screen;

/// Low band headroom when the transport cannot bundle a cycle. Leaving
/// slack keeps cosmetic updates from crowding out next cycle's motion.
const LOW_BAND_HEADROOM: f64 = 0.9;
/// Critical sends may overshoot the byte budget by this factor.
const CRITICAL_BYTE_FACTOR: usize = 2;
/// Sample target when scanning region pixels for variety and contrast.
const SCAN_SAMPLES: usize = 128;
/// Regions under this many samples skip the contrast scan entirely.
const MIN_CONTRAST_LEN: usize = 64;

/// Everything that left the dispatcher for one cycle.
#[derive(Debug, Clone, Default)]
pub struct PatchBatch {
    /// Admitted patches, critical first, then high, normal, low.
    pub patches: Vec<TilePatch>,
    pub sent_bytes: usize,
    /// Updates with a nonzero change that were withheld this cycle.
    pub deferred_updates: usize,
    pub deferred_bytes: usize,
    pub scene_change: bool,
    pub cycle: u64,
}

impl PatchBatch {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// A region update waiting for admission.
struct Pending {
    index: usize,
    region: DirtyRegion,
    data: Box<[u8]>,
    staleness: u32,
    tile_x: u32,
    tile_y: u32,
    handle: TileHandle,
    score: u64,
}

/// Decides which tile updates ship each cycle.
///
/// Updates are banded critical/high/normal/low, scored, then admitted
/// against a byte budget and a message budget derived from the transport
/// rate. Whatever does not fit is recorded on the tile so its priority
/// climbs next cycle.
pub struct Dispatcher {
    cfg: DispatchConfig,
    frame_rate: f64,
    cycle: u64,
    scene_hold: u32,
}

impl Dispatcher {
    pub fn new(cfg: DispatchConfig, tile_area: usize) -> Result<Dispatcher, PipelineError> {
        cfg.validate(tile_area)?;
        Ok(Dispatcher {
            cfg,
            frame_rate: 20.0,
            cycle: 0,
            scene_hold: 0,
        })
    }

    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.frame_rate = frame_rate.max(1.0);
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn messages_per_cycle(&self) -> usize {
        let derived = (self.cfg.messages_per_second as f64 / self.frame_rate) as usize;
        derived.max(self.cfg.min_messages_per_cycle as usize)
    }

    /// Run one dispatch cycle. Consumes the frame's updates, commits the
    /// admitted ones to their tiles, and returns what should go out.
    pub fn dispatch(&mut self, screen: &mut Screen, updates: Vec<TileUpdate>) -> PatchBatch {
        self.cycle += 1;
        let cfg = self.cfg;
        let parity = (self.cycle & 1) as u32;
        let area = screen.tile_area() as u32;
        let major_change = (area as f32 * cfg.major_change_fraction) as u32;

        let mut batch = PatchBatch {
            cycle: self.cycle,
            ..PatchBatch::default()
        };

        let majors = updates
            .iter()
            .filter(|u| match &u.diff {
                TileDiff::Region(region) => region.changed >= major_change,
                _ => false,
            })
            .count();
        let total = screen.tile_count();
        let scene = total > 0 && majors as f32 >= total as f32 * cfg.scene_change_fraction;
        if scene {
            debug!(
                "scene change at cycle {}: {majors}/{total} tiles majored",
                self.cycle
            );
            if self.scene_hold == 0 && !cfg.flags.contains(DispatchFlags::BUNDLE) {
                self.scene_hold = cfg.scene_hold_cycles;
            }
        }
        let relaxed = scene || self.scene_hold > 0;
        batch.scene_change = scene;

        let mut critical: Vec<Pending> = Vec::new();
        let mut high: Vec<Pending> = Vec::new();
        let mut normal: Vec<Pending> = Vec::new();
        let mut low: Vec<Pending> = Vec::new();

        for update in updates {
            let TileUpdate { tile: index, diff, data } = update;
            // The newest pixels are kept either way; they seed snapshots
            // and the next committed send.
            screen.tile_mut(index).set_last_processed(data.clone());

            let region = match diff {
                TileDiff::Unchanged => continue,
                TileDiff::Suppressed { changed } => {
                    screen.tile_mut(index).mark_deferred(changed);
                    batch.deferred_updates += 1;
                    continue;
                }
                TileDiff::Region(region) => region,
            };

            let tile = screen.tile(index);
            let staleness = tile.staleness();
            let accumulated = tile.accumulated();
            let score = region.changed as u64
                + staleness.min(cfg.staleness_cap) as u64 * cfg.staleness_weight as u64
                + accumulated.min(area) as u64;
            let pending = Pending {
                index,
                staleness,
                tile_x: tile.tile_x(),
                tile_y: tile.tile_y(),
                handle: tile.handle(),
                score,
                region,
                data,
            };

            // Flat regions are cosmetic while the tile is fresh; let them
            // ride in the low band instead of competing with motion.
            if cfg.flags.contains(DispatchFlags::ENTROPY_FILTER)
                && staleness < 2
                && !has_significant_changes(&pending.region.data, &cfg)
            {
                low.push(pending);
                continue;
            }

            // Checkerboard deferral of small fresh changes. Alternating
            // parity means the skipped half goes out next cycle at the
            // latest, and growing staleness bypasses the gate anyway.
            if cfg.flags.contains(DispatchFlags::SPATIAL_DOWNSAMPLE)
                && !scene
                && staleness == 0
                && pending.region.changed < area / 4
                && !is_high_contrast(&pending.region.data)
                && (pending.tile_x + pending.tile_y + parity) % 2 != 0
            {
                defer(screen, &mut batch, &pending);
                continue;
            }

            if staleness >= cfg.critical_staleness {
                critical.push(pending);
            } else if pending.region.changed >= major_change || accumulated >= area / 2 {
                high.push(pending);
            } else if pending.region.changed < cfg.min_region_pixels
                && staleness == 0
                && accumulated < cfg.min_region_pixels * 4
            {
                low.push(pending);
            } else {
                normal.push(pending);
            }
        }

        // Oldest debt first for criticals, best score first elsewhere,
        // scanline order breaking ties so output is deterministic.
        critical.sort_by(|a, b| {
            b.staleness
                .cmp(&a.staleness)
                .then(a.tile_y.cmp(&b.tile_y))
                .then(a.tile_x.cmp(&b.tile_x))
        });
        let by_score = |a: &Pending, b: &Pending| {
            b.score
                .cmp(&a.score)
                .then(a.tile_y.cmp(&b.tile_y))
                .then(a.tile_x.cmp(&b.tile_x))
        };
        high.sort_by(by_score);
        normal.sort_by(by_score);
        low.sort_by(by_score);

        let byte_cap = if relaxed {
            (cfg.byte_budget as f64 * cfg.scene_byte_boost as f64) as usize
        } else {
            cfg.byte_budget
        };
        let message_cap = if cfg.flags.contains(DispatchFlags::BUNDLE) {
            usize::MAX
        } else {
            let base = self.messages_per_cycle();
            if relaxed {
                (base as f64 * cfg.scene_message_boost as f64) as usize
            } else {
                base
            }
        };

        let mut sent_bytes = 0usize;
        let mut messages = 0usize;

        // Criticals ignore the message cap and get byte overdraft against
        // the base budget, scene boost or not; a tile can only wait so
        // long before correctness beats smoothness.
        let critical_cap = cfg.byte_budget * CRITICAL_BYTE_FACTOR;
        for pending in critical {
            let size = pending.region.data_size();
            if sent_bytes + size > critical_cap {
                defer(screen, &mut batch, &pending);
                continue;
            }
            admit(screen, &mut batch, pending, &mut sent_bytes);
            messages += 1;
        }

        for pending in high.into_iter().chain(normal) {
            if messages >= message_cap {
                defer(screen, &mut batch, &pending);
                continue;
            }
            let size = pending.region.data_size();
            if sent_bytes + size > byte_cap {
                defer(screen, &mut batch, &pending);
                continue;
            }
            admit(screen, &mut batch, pending, &mut sent_bytes);
            messages += 1;
        }

        if relaxed {
            // While a cut settles the low band only adds noise on top of
            // the full repaint; push it wholesale to later cycles.
            for pending in low {
                defer(screen, &mut batch, &pending);
            }
        } else {
            let low_cap = if cfg.flags.contains(DispatchFlags::BUNDLE) {
                byte_cap
            } else {
                (byte_cap as f64 * LOW_BAND_HEADROOM) as usize
            };
            for pending in low {
                if messages >= message_cap {
                    defer(screen, &mut batch, &pending);
                    continue;
                }
                let size = pending.region.data_size();
                if sent_bytes + size > low_cap {
                    defer(screen, &mut batch, &pending);
                    continue;
                }
                admit(screen, &mut batch, pending, &mut sent_bytes);
                messages += 1;
            }
        }

        if self.scene_hold > 0 {
            self.scene_hold -= 1;
        }
        batch.sent_bytes = sent_bytes;
        batch
    }
}

fn admit(screen: &mut Screen, batch: &mut PatchBatch, pending: Pending, sent_bytes: &mut usize) {
    *sent_bytes += pending.region.data_size();
    batch
        .patches
        .push(TilePatch::from_region(pending.handle, pending.region));
    screen.tile_mut(pending.index).mark_sent(pending.data);
}

fn defer(screen: &mut Screen, batch: &mut PatchBatch, pending: &Pending) {
    screen
        .tile_mut(pending.index)
        .mark_deferred(pending.region.changed);
    batch.deferred_updates += 1;
    batch.deferred_bytes += pending.region.data_size();
}

/// A region is worth fresh-band bandwidth only when a sparse sample shows
/// real color variety; tiny regions never qualify.
fn has_significant_changes(data: &[u8], cfg: &DispatchConfig) -> bool {
    if data.len() < cfg.min_region_pixels as usize {
        return false;
    }
    let step = (data.len() / SCAN_SAMPLES).max(1);
    let mut seen = [false; 256];
    let mut unique = 0u32;
    let mut i = 0;
    while i < data.len() {
        let p = data[i] as usize;
        if !seen[p] {
            seen[p] = true;
            unique += 1;
            if unique >= cfg.min_unique_colors {
                return true;
            }
        }
        i += step;
    }
    false
}

/// Sampled two-color dominance test. Text and line art flicker badly when
/// half a glyph arrives a cycle late, so such regions skip the
/// checkerboard gate.
fn is_high_contrast(data: &[u8]) -> bool {
    if data.len() < MIN_CONTRAST_LEN {
        return false;
    }
    let step = (data.len() / SCAN_SAMPLES).max(1);
    let mut counts = [0u32; 256];
    let mut samples = 0u32;
    let mut i = 0;
    while i < data.len() {
        counts[data[i] as usize] += 1;
        samples += 1;
        i += step;
    }
    let mut top = 0u32;
    let mut second = 0u32;
    for &count in counts.iter() {
        if count > top {
            second = top;
            top = count;
        } else if count > second {
            second = count;
        }
    }
    (top + second) as f32 > samples as f32 * 0.8
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::screen::test::screen_2x2;

    fn dispatcher(cfg: DispatchConfig, screen: &Screen) -> Dispatcher {
        Dispatcher::new(cfg, screen.tile_area()).unwrap()
    }

    fn quiet_cfg() -> DispatchConfig {
        DispatchConfig {
            flags: DispatchFlags::empty(),
            byte_budget: 10 * 1024 * 1024,
            ..DispatchConfig::default()
        }
    }

    /// Full-tile update: every pixel changed.
    fn full_update(screen: &Screen, index: usize, color: u8) -> TileUpdate {
        let side = screen.side() as u16;
        let area = screen.tile_area();
        let data: Box<[u8]> = vec![color; area].into_boxed_slice();
        TileUpdate {
            tile: index,
            diff: TileDiff::Region(DirtyRegion {
                x: 0,
                y: 0,
                width: side,
                height: side,
                data: data.clone(),
                changed: area as u32,
            }),
            data,
        }
    }

    /// Partial update with a chosen change count and region size.
    fn region_update(
        screen: &Screen,
        index: usize,
        changed: u32,
        (width, height): (u16, u16),
        fill: impl Fn(usize) -> u8,
    ) -> TileUpdate {
        let len = width as usize * height as usize;
        let region_data: Box<[u8]> = (0..len).map(&fill).collect();
        TileUpdate {
            tile: index,
            diff: TileDiff::Region(DirtyRegion {
                x: 0,
                y: 0,
                width,
                height,
                data: region_data,
                changed,
            }),
            data: vec![fill(0); screen.tile_area()].into_boxed_slice(),
        }
    }

    fn age_tile(screen: &mut Screen, index: usize, cycles: u32) {
        for _ in 0..cycles {
            screen.tile_mut(index).mark_deferred(8);
        }
    }

    #[test]
    fn unchanged_screen_produces_an_empty_batch() {
        let mut screen = screen_2x2(32);
        let mut dispatcher = dispatcher(quiet_cfg(), &screen);
        let updates = (0..4)
            .map(|i| TileUpdate {
                tile: i,
                diff: TileDiff::Unchanged,
                data: vec![1u8; screen.tile_area()].into_boxed_slice(),
            })
            .collect();
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert!(batch.is_empty());
        assert_eq!(batch.sent_bytes, 0);
        assert_eq!(batch.deferred_updates, 0);
        // The pixels still landed in tile state for snapshots.
        assert!(screen.tile(0).snapshot_data().is_some());
    }

    #[test]
    fn first_full_frame_ships_every_tile() {
        let mut screen = screen_2x2(32);
        let mut dispatcher = dispatcher(quiet_cfg(), &screen);
        let updates = (0..4).map(|i| full_update(&screen, i, 5)).collect();
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 4);
        assert!(batch.scene_change, "4/4 major changes is a scene cut");
        assert_eq!(batch.sent_bytes, 4 * 1024);
        for tile in screen.tiles() {
            assert_eq!(tile.staleness(), 0);
            assert!(!tile.needs_full_update());
        }
    }

    #[test]
    fn byte_budget_defers_overflow_in_scanline_order() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            byte_budget: 2048,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        let updates = (0..3).map(|i| full_update(&screen, i, 9)).collect();
        let batch = dispatcher.dispatch(&mut screen, updates);

        // 3/4 majors relaxes the budget to 2560, room for two full tiles.
        assert!(batch.scene_change);
        assert_eq!(batch.patches.len(), 2);
        assert_eq!(batch.sent_bytes, 2048);
        assert_eq!(batch.deferred_updates, 1);
        assert_eq!(batch.deferred_bytes, 1024);
        let sent: Vec<TileHandle> = batch.patches.iter().map(|p| p.target).collect();
        assert_eq!(sent, vec![TileHandle(100), TileHandle(101)]);
        assert_eq!(screen.tile(2).staleness(), 1);
        assert_eq!(screen.tile(2).accumulated(), 1024);
    }

    #[test]
    fn stale_tile_preempts_fresh_motion() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            messages_per_second: 1,
            min_messages_per_cycle: 1,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 3, 3);

        let updates = vec![
            full_update(&screen, 0, 2),
            region_update(&screen, 3, 40, (8, 5), |i| (i % 7) as u8 + 1),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);

        // The stale tile is critical: it ships outside the message cap,
        // and the fresh full-tile change waits.
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(103));
        assert_eq!(screen.tile(3).staleness(), 0);
        assert_eq!(screen.tile(0).staleness(), 1);
    }

    #[test]
    fn message_cap_vanishes_when_bundled() {
        let small = |screen: &Screen, i| region_update(screen, i, 100, (10, 10), |p| (p % 16) as u8 + 1);
        let cfg = DispatchConfig {
            messages_per_second: 1,
            min_messages_per_cycle: 1,
            ..quiet_cfg()
        };

        let mut screen = screen_2x2(32);
        let mut unbundled = dispatcher(cfg, &screen);
        let updates = (0..4).map(|i| small(&screen, i)).collect();
        let batch = unbundled.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.deferred_updates, 3);

        let bundle_cfg = DispatchConfig {
            flags: DispatchFlags::BUNDLE,
            ..cfg
        };
        let mut screen = screen_2x2(32);
        let mut bundled = dispatcher(bundle_cfg, &screen);
        let updates = (0..4).map(|i| small(&screen, i)).collect();
        let batch = bundled.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 4);
        assert_eq!(batch.deferred_updates, 0);
    }

    #[test]
    fn scene_change_starves_the_low_band() {
        for flags in [DispatchFlags::empty(), DispatchFlags::BUNDLE] {
            let mut screen = screen_2x2(32);
            let cfg = DispatchConfig { flags, ..quiet_cfg() };
            let mut dispatcher = dispatcher(cfg, &screen);

            let mut updates: Vec<TileUpdate> =
                (0..3).map(|i| full_update(&screen, i, 3)).collect();
            updates.push(region_update(&screen, 3, 8, (4, 2), |_| 6));
            let batch = dispatcher.dispatch(&mut screen, updates);

            assert!(batch.scene_change);
            assert_eq!(batch.patches.len(), 3, "flags {flags:?}");
            assert_eq!(batch.deferred_updates, 1);
            assert_eq!(screen.tile(3).staleness(), 1);
        }
    }

    #[test]
    fn scene_hold_keeps_low_band_starved_for_extra_cycles() {
        let mut screen = screen_2x2(32);
        let mut dispatcher = dispatcher(quiet_cfg(), &screen);

        // Cycle 1: a cut. Unbundled, so the relaxation lingers.
        let mut updates: Vec<TileUpdate> = (0..3).map(|i| full_update(&screen, i, 3)).collect();
        updates.push(region_update(&screen, 3, 8, (4, 2), |_| 6));
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert!(batch.scene_change);
        assert_eq!(batch.patches.len(), 3);

        // Cycle 2: no cut, but the hold still defers fresh low traffic.
        let updates = vec![region_update(&screen, 0, 8, (4, 2), |_| 9)];
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert!(!batch.scene_change);
        assert_eq!(batch.patches.len(), 0);
        assert_eq!(batch.deferred_updates, 1);

        // Cycle 3: the hold expired; low traffic flows again.
        let updates = vec![region_update(&screen, 1, 8, (4, 2), |_| 9)];
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(101));
    }

    #[test]
    fn checkerboard_alternates_and_staleness_bypasses() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            flags: DispatchFlags::SPATIAL_DOWNSAMPLE,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        let noisy = |p: usize| (p % 16) as u8 + 1;

        let updates = (0..4)
            .map(|i| region_update(&screen, i, 100, (10, 10), noisy))
            .collect();
        let batch = dispatcher.dispatch(&mut screen, updates);

        // Cycle parity 1: tiles with even x+y sit this one out.
        let sent: Vec<TileHandle> = batch.patches.iter().map(|p| p.target).collect();
        assert_eq!(sent, vec![TileHandle(101), TileHandle(102)]);
        assert_eq!(batch.deferred_updates, 2);

        // The deferred half is no longer fresh, so it ships next cycle
        // regardless of parity.
        let updates = vec![
            region_update(&screen, 0, 100, (10, 10), noisy),
            region_update(&screen, 3, 100, (10, 10), noisy),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);
        let sent: Vec<TileHandle> = batch.patches.iter().map(|p| p.target).collect();
        assert_eq!(sent, vec![TileHandle(100), TileHandle(103)]);
    }

    #[test]
    fn entropy_filter_pushes_flat_regions_to_low_band() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            flags: DispatchFlags::ENTROPY_FILTER,
            byte_budget: 1024,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);

        let updates = vec![
            // Flat region: one color, 600 bytes, demoted to low.
            region_update(&screen, 0, 300, (24, 25), |_| 7),
            // Varied region of the same size stays in the normal band.
            region_update(&screen, 1, 300, (24, 25), |p| (p % 32) as u8 + 1),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);

        // 600 normal bytes fit; the demoted flat region busts the low
        // band's 90% headroom and waits.
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(101));
        assert_eq!(batch.deferred_updates, 1);
        assert_eq!(screen.tile(0).staleness(), 1);
    }

    #[test]
    fn entropy_filter_parks_tiny_regions_during_a_cut() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            flags: DispatchFlags::ENTROPY_FILTER,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 3, 1);

        // Three full repaints trip the cut; the lone 8-pixel region is
        // too small to count as significant, so it rides the starved low
        // band even though its tile already waited a cycle.
        let mut updates: Vec<TileUpdate> = (0..3).map(|i| full_update(&screen, i, 3)).collect();
        updates.push(region_update(&screen, 3, 8, (4, 2), |_| 6));
        let batch = dispatcher.dispatch(&mut screen, updates);

        assert!(batch.scene_change);
        assert_eq!(batch.patches.len(), 3);
        assert_eq!(batch.deferred_updates, 1);
        assert_eq!(screen.tile(3).staleness(), 2);
    }

    #[test]
    fn entropy_filter_ignores_stale_tiles() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            flags: DispatchFlags::ENTROPY_FILTER,
            messages_per_second: 1,
            min_messages_per_cycle: 1,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 0, 2);

        let updates = vec![
            // Flat but stale: skips the filter, and 600 changed pixels
            // outranks the fresh varied region.
            region_update(&screen, 0, 600, (24, 25), |_| 7),
            region_update(&screen, 1, 300, (24, 25), |p| (p % 32) as u8 + 1),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(100));
    }

    #[test]
    fn staleness_weight_outscores_raw_change() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            messages_per_second: 1,
            min_messages_per_cycle: 1,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 1, 1);

        let noisy = |p: usize| (p % 9) as u8 + 1;
        let updates = vec![
            region_update(&screen, 0, 100, (10, 10), noisy),
            // 50 changed + one deferral's weight beats 100 fresh.
            region_update(&screen, 1, 50, (8, 8), noisy),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(101));
    }

    #[test]
    fn critical_band_gets_byte_overdraft_but_not_more() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            byte_budget: 1280,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 0, 5);
        age_tile(&mut screen, 1, 4);
        age_tile(&mut screen, 2, 3);
        age_tile(&mut screen, 3, 3);

        let updates = (0..4).map(|i| full_update(&screen, i, 8)).collect();
        let batch = dispatcher.dispatch(&mut screen, updates);

        // The cut relaxes ordinary traffic to 1600 bytes, but the critical
        // overdraft stays pinned to twice the base budget: 2560 admits two
        // full tiles, oldest debt first, and the third would need 3072.
        let sent: Vec<TileHandle> = batch.patches.iter().map(|p| p.target).collect();
        assert_eq!(sent, vec![TileHandle(100), TileHandle(101)]);
        assert_eq!(batch.deferred_updates, 2);
        assert_eq!(screen.tile(2).staleness(), 4);
    }

    #[test]
    fn batch_orders_bands_critical_first() {
        let mut screen = screen_2x2(32);
        let mut dispatcher = dispatcher(quiet_cfg(), &screen);
        age_tile(&mut screen, 2, 3);
        let noisy = |p: usize| (p % 11) as u8 + 1;

        let updates = vec![
            region_update(&screen, 0, 8, (4, 2), noisy), // low
            region_update(&screen, 1, 100, (10, 10), noisy), // normal
            region_update(&screen, 2, 40, (8, 5), noisy), // critical by staleness
            full_update(&screen, 3, 4),                   // high
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);
        let sent: Vec<TileHandle> = batch.patches.iter().map(|p| p.target).collect();
        assert_eq!(
            sent,
            vec![
                TileHandle(102),
                TileHandle(103),
                TileHandle(101),
                TileHandle(100)
            ]
        );
        assert_eq!(batch.sent_bytes, 40 + 100 + 1024 + 8);
    }

    #[test]
    fn every_region_is_sent_or_deferred() {
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            byte_budget: 1024,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        let noisy = |p: usize| (p % 5) as u8 + 1;

        let updates = vec![
            TileUpdate {
                tile: 0,
                diff: TileDiff::Unchanged,
                data: vec![1u8; 1024].into_boxed_slice(),
            },
            TileUpdate {
                tile: 1,
                diff: TileDiff::Suppressed { changed: 3 },
                data: vec![1u8; 1024].into_boxed_slice(),
            },
            full_update(&screen, 2, 2),
            region_update(&screen, 3, 200, (16, 16), noisy),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);

        // Two regions and one suppression: everything is accounted for.
        assert_eq!(batch.patches.len() + batch.deferred_updates, 3);
        assert_eq!(screen.tile(0).staleness(), 0);
        assert_eq!(screen.tile(1).staleness(), 1);
        assert_eq!(screen.tile(1).accumulated(), 3);
        // Whoever shipped holds a committed send now.
        for patch in &batch.patches {
            let index = (patch.target.0 - 100) as usize;
            assert_eq!(screen.tile(index).staleness(), 0);
            assert!(screen.tile(index).snapshot_data().is_some());
        }
    }

    #[test]
    fn sampling_helpers_classify_variety_and_contrast() {
        let cfg = DispatchConfig::default();
        // Tiny regions never qualify, whatever their variety.
        assert!(!has_significant_changes(&[1u8; 8], &cfg));
        // Flat data has one unique color.
        assert!(!has_significant_changes(&[1u8; 512], &cfg));
        let varied: Vec<u8> = (0..512).map(|i| (i % 16) as u8).collect();
        assert!(has_significant_changes(&varied, &cfg));

        // Two-tone data is high contrast, rainbow data is not.
        let two_tone: Vec<u8> = (0..512).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
        assert!(is_high_contrast(&two_tone));
        assert!(!is_high_contrast(&varied));
        assert!(!is_high_contrast(&[1u8; 32]), "short data skips the scan");
    }

    #[test]
    fn configurable_thresholds_change_banding() {
        // With a raised critical threshold the aged tile stays high band
        // and obeys the message cap.
        let mut screen = screen_2x2(32);
        let cfg = DispatchConfig {
            critical_staleness: 10,
            messages_per_second: 1,
            min_messages_per_cycle: 1,
            ..quiet_cfg()
        };
        let mut dispatcher = dispatcher(cfg, &screen);
        age_tile(&mut screen, 3, 3);

        let updates = vec![
            full_update(&screen, 0, 2),
            region_update(&screen, 3, 40, (8, 5), |i| (i % 7) as u8 + 1),
        ];
        let batch = dispatcher.dispatch(&mut screen, updates);
        // Full tile outscored the aged region; only one message allowed.
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.patches[0].target, TileHandle(100));
    }
}
