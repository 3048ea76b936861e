use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use log::info;
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;

use tilecast::config::{DispatchConfig, DitherConfig, TrackerConfig};
use tilecast::dispatch::PatchBatch;
use tilecast::palette::{ColorTables, Palette};
use tilecast::player::{Player, PlayerState};
use tilecast::processor::Pipeline;
use tilecast::screen::Screen;
use tilecast::source::{ImageDirSource, PatternSource};

struct Options {
    cols: u32,
    rows: u32,
    side: usize,
    fps: f64,
    frames: u64,
    scale: f32,
    images: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cols: 4,
            rows: 3,
            side: 128,
            fps: 20.0,
            frames: 600,
            scale: 2.0,
            images: None,
        }
    }
}

fn usage() {
    eprintln!("usage: tilecast-play [OPTIONS] [IMAGE_DIR]");
    eprintln!();
    eprintln!("Plays a directory of png/jpeg frames, or a synthetic test");
    eprintln!("pattern, reconstructing the display from dispatched patches");
    eprintln!("exactly as a remote viewer would.");
    eprintln!();
    eprintln!("  --cols N   tile columns (default 4)");
    eprintln!("  --rows N   tile rows (default 3)");
    eprintln!("  --tile N   tile side in pixels (default 128)");
    eprintln!("  --fps F    frame rate (default 20)");
    eprintln!("  --frames N test pattern length (default 600)");
    eprintln!("  --scale F  window scale (default 2)");
    eprintln!();
    eprintln!("  space      pause and resume");
    eprintln!("  left/right seek 100 frames");
    eprintln!("  r          force a full resend");
    eprintln!("  escape     quit");
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
            "--scale" => opts.scale = number(&mut args, "--scale")?,
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

/// Write a batch into the viewer's index canvas.
fn apply_batch(
    indices: &mut [u8],
    stride: usize,
    origins: &HashMap<u32, (usize, usize)>,
    batch: &PatchBatch,
) {
    for patch in &batch.patches {
        let (ox, oy) = match origins.get(&patch.target.0) {
            Some(&origin) => origin,
            None => continue,
        };
        let width = patch.width as usize;
        for row in 0..patch.height as usize {
            let src = row * width;
            let dst = (oy + patch.y as usize + row) * stride + ox + patch.x as usize;
            indices[dst..dst + width].copy_from_slice(&patch.data[src..src + width]);
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = parse_args()?;

    let palette = Palette::base();
    let tables = Arc::new(ColorTables::build(&palette));
    let mut colors = [(0u8, 0u8, 0u8); 256];
    for i in 0..palette.len() {
        colors[i] = palette.rgb(i as u8);
    }

    let screen = Screen::with_sequential_handles(opts.cols, opts.rows, opts.side, 1)?;
    let (width, height) = (screen.pixel_width(), screen.pixel_height());
    let mut origins = HashMap::new();
    for tile in screen.tiles() {
        origins.insert(
            tile.handle().0,
            (
                tile.tile_x() as usize * opts.side,
                tile.tile_y() as usize * opts.side,
            ),
        );
    }

    let pipeline = Pipeline::new(
        screen,
        tables,
        DitherConfig::default(),
        TrackerConfig::default(),
        DispatchConfig::default(),
    )?;

    let (tx, rx) = mpsc::channel::<PatchBatch>();
    let mut player = match opts.images {
        Some(ref dir) => Player::new(
            ImageDirSource::open(dir, opts.fps)?,
            pipeline,
            move |batch| {
                let _ = tx.send(batch);
            },
        ),
        None => Player::new(
            PatternSource::new(width, height, opts.frames, opts.fps),
            pipeline,
            move |batch| {
                let _ = tx.send(batch);
            },
        ),
    };
    player.set_on_complete(|| info!("stream complete"));

    // init sdl2
    let sdl_context = sdl2::init().map_err(anyhow::Error::msg)?;
    let video_subsystem = sdl_context.video().map_err(anyhow::Error::msg)?;
    let window = video_subsystem
        .window(
            "Tile viewer",
            (width as f32 * opts.scale) as u32,
            (height as f32 * opts.scale) as u32,
        )
        .position_centered()
        .build()?;

    let mut canvas = window.into_canvas().build()?;
    let mut event_pump = sdl_context.event_pump().map_err(anyhow::Error::msg)?;
    canvas.set_scale(opts.scale, opts.scale).map_err(anyhow::Error::msg)?;

    let creator = canvas.texture_creator();
    let mut texture =
        creator.create_texture_target(PixelFormatEnum::RGB24, width as u32, height as u32)?;

    let mut indices = vec![0u8; width * height];
    let mut rgb = vec![0u8; width * height * 3];
    let mut stream_done = false;
    texture.update(None, &rgb, width * 3)?;

    player.play()?;

    'running: loop {
        for event in event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                } => break 'running,
                Event::KeyDown {
                    keycode: Some(Keycode::Space),
                    repeat: false,
                    ..
                } => match player.state() {
                    PlayerState::Playing => player.pause(),
                    PlayerState::Paused => player.resume(),
                    _ => {}
                },
                Event::KeyDown {
                    keycode: Some(Keycode::R),
                    ..
                } => player.invalidate_all(),
                Event::KeyDown {
                    keycode: Some(Keycode::Right),
                    ..
                } => player.seek(player.current_frame() + 100),
                Event::KeyDown {
                    keycode: Some(Keycode::Left),
                    ..
                } => player.seek(player.current_frame().saturating_sub(100)),
                _ => {}
            }
        }

        let mut touched = false;
        loop {
            match rx.try_recv() {
                Ok(batch) => {
                    apply_batch(&mut indices, width, &origins, &batch);
                    touched = !batch.is_empty() || touched;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !stream_done {
                        info!("{}", player.metrics());
                        stream_done = true;
                    }
                    break;
                }
            }
        }

        if touched {
            for (pixel, &index) in indices.iter().enumerate() {
                let (r, g, b) = colors[index as usize];
                rgb[pixel * 3] = r;
                rgb[pixel * 3 + 1] = g;
                rgb[pixel * 3 + 2] = b;
            }
            texture.update(None, &rgb, width * 3).unwrap();
        }
        canvas.copy(&texture, None, None).unwrap();
        canvas.present();
        std::thread::sleep(Duration::from_millis(15));
    }

    player.stop();
    player.join()?;
    Ok(())
}
