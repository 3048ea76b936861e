use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use log::{debug, info};

use tilecast::config::{DispatchConfig, DispatchFlags, DitherConfig, TrackerConfig};
use tilecast::dispatch::PatchBatch;
use tilecast::dither::DitherMode;
use tilecast::palette::{ColorTables, Palette};
use tilecast::player::Player;
use tilecast::processor::Pipeline;
use tilecast::screen::Screen;
use tilecast::source::{ImageDirSource, PatternSource};

struct Options {
    cols: u32,
    rows: u32,
    side: usize,
    fps: f64,
    frames: u64,
    mode: DitherMode,
    temporal: bool,
    bundle: bool,
    images: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cols: 4,
            rows: 3,
            side: 128,
            fps: 20.0,
            frames: 300,
            mode: DitherMode::ErrorDiffusion { strength: 0.8 },
            temporal: true,
            bundle: false,
            images: None,
        }
    }
}

fn usage() {
    eprintln!("usage: tilecast-headless [OPTIONS] [IMAGE_DIR]");
    eprintln!();
    eprintln!("Streams a directory of png/jpeg frames, or a synthetic test");
    eprintln!("pattern when no directory is given, and reports what the");
    eprintln!("dispatcher would put on the wire.");
    eprintln!();
    eprintln!("  --cols N        tile columns (default 4)");
    eprintln!("  --rows N        tile rows (default 3)");
    eprintln!("  --tile N        tile side in pixels (default 128)");
    eprintln!("  --fps F         frame rate (default 20)");
    eprintln!("  --frames N      test pattern length (default 300)");
    eprintln!("  --dither MODE   none, ordered or diffuse (default diffuse)");
    eprintln!("  --no-temporal   disable temporal reuse");
    eprintln!("  --bundle        treat the transport as atomic per cycle");
}

fn parse_args() -> anyhow::Result<Options> {
    let mut opts = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cols" => opts.cols = number(&mut args, "--cols")?,
            "--rows" => opts.rows = number(&mut args, "--rows")?,
            "--tile" => opts.side = number(&mut args, "--tile")?,
            "--fps" => opts.fps = number(&mut args, "--fps")?,
            "--frames" => opts.frames = number(&mut args, "--frames")?,
            "--dither" => {
                let mode = args.next().context("--dither needs a mode")?;
                opts.mode = match mode.as_str() {
                    "none" => DitherMode::None,
                    "ordered" => DitherMode::Ordered,
                    "diffuse" => DitherMode::ErrorDiffusion { strength: 0.8 },
                    other => bail!("unknown dither mode {other:?}"),
                };
            }
            "--no-temporal" => opts.temporal = false,
            "--bundle" => opts.bundle = true,
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {other:?}"),
            other => opts.images = Some(PathBuf::from(other)),
        }
    }
    Ok(opts)
}

fn number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> anyhow::Result<T> {
    let value = args.next().with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{flag} got {value:?}, expected a number"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = parse_args()?;

    let palette = Palette::base();
    let started = Instant::now();
    let tables = Arc::new(ColorTables::build(&palette));
    info!(
        "lookup tables for {} colors built in {:?}",
        palette.len(),
        started.elapsed()
    );

    let screen = Screen::with_sequential_handles(opts.cols, opts.rows, opts.side, 1)?;
    info!(
        "screen {}x{} tiles of {}px, {}x{} pixels",
        screen.cols(),
        screen.rows(),
        screen.side(),
        screen.pixel_width(),
        screen.pixel_height()
    );
    let (width, height) = (screen.pixel_width(), screen.pixel_height());

    let dither = DitherConfig {
        mode: opts.mode,
        temporal: opts.temporal,
        ..DitherConfig::default()
    };
    let mut dispatch = DispatchConfig::default();
    if opts.bundle {
        dispatch.flags |= DispatchFlags::BUNDLE;
    }
    let pipeline = Pipeline::new(
        screen,
        tables.clone(),
        dither,
        TrackerConfig::default(),
        dispatch,
    )?;

    let sink = move |batch: PatchBatch| {
        if batch.scene_change {
            info!(
                "cycle {}: scene change, {} patches ({} B)",
                batch.cycle,
                batch.patches.len(),
                batch.sent_bytes
            );
        } else if !batch.is_empty() {
            debug!(
                "cycle {}: {} patches ({} B), {} deferred",
                batch.cycle,
                batch.patches.len(),
                batch.sent_bytes,
                batch.deferred_updates
            );
        }
    };

    let mut player = match opts.images {
        Some(ref dir) => Player::new(ImageDirSource::open(dir, opts.fps)?, pipeline, sink),
        None => Player::new(
            PatternSource::new(width, height, opts.frames, opts.fps),
            pipeline,
            sink,
        ),
    };
    player.set_on_complete(|| info!("stream complete"));

    player.play()?;
    player.join()?;

    // What a viewer joining now would be sent.
    let resting = player.snapshot();
    info!("snapshot holds {} tiles", resting.len());

    let black = tables.nearest_index(0, 0, 0);
    let end_card = player.fill(black);
    info!("end card: {} full-tile patches", end_card.len());

    println!("{}", player.metrics());
    Ok(())
}
