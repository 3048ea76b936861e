use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::dispatch::PatchBatch;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::processor::Pipeline;
use crate::screen::tile::TilePatch;
use crate::FrameSource;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle = 0,
    Loading = 1,
    Playing = 2,
    Paused = 3,
    Stopped = 4,
}

impl PlayerState {
    fn from_u8(v: u8) -> PlayerState {
        match v {
            1 => PlayerState::Loading,
            2 => PlayerState::Playing,
            3 => PlayerState::Paused,
            4 => PlayerState::Stopped,
            _ => PlayerState::Idle,
        }
    }
}

/// Control surface shared with the worker thread.
struct Shared {
    state: AtomicU8,
    current_frame: AtomicU64,
    frames_done: AtomicU64,
    frames_skipped: AtomicU64,
    /// Pending seek target, -1 when none.
    seek_to: AtomicI64,
}

/// Streams a source through a pipeline on its own thread.
///
/// Each frame is processed at its scheduled instant on a virtual clock
/// anchored at playback start, so timing errors never accumulate. The
/// resulting batches go to the sink callback; pause, resume, seek and
/// stop flip atomics the worker observes between frames.
pub struct Player {
    shared: Arc<Shared>,
    pipeline: Arc<Mutex<Pipeline>>,
    frame_rate: f64,
    frame_count: Option<u64>,
    worker: Option<JoinHandle<()>>,
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FnMut(PatchBatch) + Send>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl Player {
    pub fn new(
        source: impl FrameSource + 'static,
        mut pipeline: Pipeline,
        sink: impl FnMut(PatchBatch) + Send + 'static,
    ) -> Player {
        let frame_rate = source.frame_rate().max(1.0);
        let frame_count = source.frame_count();
        pipeline.set_frame_rate(frame_rate);
        Player {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PlayerState::Idle as u8),
                current_frame: AtomicU64::new(0),
                frames_done: AtomicU64::new(0),
                frames_skipped: AtomicU64::new(0),
                seek_to: AtomicI64::new(-1),
            }),
            pipeline: Arc::new(Mutex::new(pipeline)),
            frame_rate,
            frame_count,
            worker: None,
            source: Some(Box::new(source)),
            sink: Some(Box::new(sink)),
            on_complete: None,
        }
    }

    /// Called once when the source runs dry. Set before `play`.
    pub fn set_on_complete(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_complete = Some(Box::new(f));
    }

    /// Start the worker. A player drives one playback; it cannot be
    /// restarted after stopping.
    pub fn play(&mut self) -> Result<(), PipelineError> {
        let source = self
            .source
            .take()
            .ok_or_else(|| PipelineError::source("player was already started"))?;
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Err(PipelineError::source("player was already started")),
        };
        let on_complete = self.on_complete.take();
        self.shared
            .state
            .store(PlayerState::Loading as u8, Ordering::Release);

        let shared = self.shared.clone();
        let pipeline = self.pipeline.clone();
        let interval = Duration::from_secs_f64(1.0 / self.frame_rate);
        let worker = thread::Builder::new()
            .name("tilecast-player".into())
            .spawn(move || run_loop(source, sink, pipeline, shared, interval, on_complete))?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn pause(&self) {
        let _ = self.shared.state.compare_exchange(
            PlayerState::Playing as u8,
            PlayerState::Paused as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub fn resume(&self) {
        let _ = self.shared.state.compare_exchange(
            PlayerState::Paused as u8,
            PlayerState::Playing as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// End playback. Does not fire the completion callback.
    pub fn stop(&self) {
        self.shared
            .state
            .store(PlayerState::Stopped as u8, Ordering::Release);
    }

    /// Jump to a frame; clamped to the stream when its length is known.
    /// Takes effect before the next processed frame.
    pub fn seek(&self, frame: u64) {
        let target = match self.frame_count {
            Some(n) if n > 0 => frame.min(n - 1),
            _ => frame,
        }
        .min(i64::MAX as u64);
        self.shared.seek_to.store(target as i64, Ordering::Release);
    }

    pub fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Index of the last frame that reached the sink.
    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame.load(Ordering::Acquire)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.shared.frames_skipped.load(Ordering::Acquire)
    }

    /// Consumed fraction of the stream, when its length is known.
    pub fn progress(&self) -> Option<f64> {
        let done = self.shared.frames_done.load(Ordering::Acquire);
        self.frame_count.map(|count| {
            if count == 0 {
                1.0
            } else {
                (done as f64 / count as f64).min(1.0)
            }
        })
    }

    pub fn metrics(&self) -> PipelineMetrics {
        lock_pipeline(&self.pipeline).metrics().clone()
    }

    /// Current screen content for a late joiner. Briefly blocks the
    /// worker between cycles.
    pub fn snapshot(&self) -> Vec<TilePatch> {
        lock_pipeline(&self.pipeline).snapshot()
    }

    /// Paint the whole screen one color, e.g. as an end card.
    pub fn fill(&self, color: u8) -> Vec<TilePatch> {
        lock_pipeline(&self.pipeline).fill(color)
    }

    /// Force full resends on the next cycle.
    pub fn invalidate_all(&self) {
        lock_pipeline(&self.pipeline).invalidate_all();
    }

    /// Wait for the worker to finish.
    pub fn join(&mut self) -> Result<(), PipelineError> {
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| PipelineError::source("player thread panicked"))?;
        }
        Ok(())
    }
}

fn lock_pipeline(pipeline: &Mutex<Pipeline>) -> MutexGuard<'_, Pipeline> {
    pipeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_loop(
    mut source: Box<dyn FrameSource>,
    mut sink: Box<dyn FnMut(PatchBatch) + Send>,
    pipeline: Arc<Mutex<Pipeline>>,
    shared: Arc<Shared>,
    interval: Duration,
    mut on_complete: Option<Box<dyn FnOnce() + Send>>,
) {
    let _ = shared.state.compare_exchange(
        PlayerState::Loading as u8,
        PlayerState::Playing as u8,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );

    let mut frame_index: u64 = 0;
    let mut deadline = Instant::now();

    loop {
        match PlayerState::from_u8(shared.state.load(Ordering::Acquire)) {
            PlayerState::Stopped | PlayerState::Idle => break,
            PlayerState::Paused => {
                thread::sleep(Duration::from_millis(5));
                // Position is kept; the clock re-anchors on resume.
                deadline = Instant::now();
                continue;
            }
            PlayerState::Playing | PlayerState::Loading => {}
        }

        let requested = shared.seek_to.swap(-1, Ordering::AcqRel);
        if requested >= 0 {
            let target = requested as u64;
            match source.seek(target) {
                Ok(()) => {
                    debug!("seek to frame {target}");
                    frame_index = target;
                    deadline = Instant::now();
                }
                Err(err) => warn!("seek to frame {target} failed: {err}"),
            }
        }

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        // Late frames run immediately; the fixed step keeps long-term
        // pacing anchored rather than drifting per frame.
        deadline += interval;

        if PlayerState::from_u8(shared.state.load(Ordering::Acquire)) != PlayerState::Playing {
            continue;
        }

        let fetch_started = Instant::now();
        let fetched = source.next_frame();
        let fetch_elapsed = fetch_started.elapsed();

        match fetched {
            Err(err) => {
                warn!("frame {frame_index} failed, skipping: {err}");
                shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                shared.frames_done.fetch_add(1, Ordering::Relaxed);
                let mut pipeline = lock_pipeline(&pipeline);
                pipeline.metrics_mut().source.record(fetch_elapsed);
                pipeline.metrics_mut().frames_skipped += 1;
                frame_index += 1;
            }
            Ok(None) => {
                debug!("source exhausted after {frame_index} frames");
                shared
                    .state
                    .store(PlayerState::Stopped as u8, Ordering::Release);
                if let Some(complete) = on_complete.take() {
                    complete();
                }
                break;
            }
            Ok(Some(frame)) => {
                let cycle = {
                    let mut pipeline = lock_pipeline(&pipeline);
                    pipeline.metrics_mut().source.record(fetch_elapsed);
                    pipeline.run_cycle(&frame)
                };
                match cycle {
                    Ok(batch) => {
                        shared.current_frame.store(frame_index, Ordering::Release);
                        shared.frames_done.fetch_add(1, Ordering::Relaxed);
                        // Outside the lock so snapshots can interleave
                        // with slow transports.
                        sink(batch);
                    }
                    Err(err) => {
                        warn!("cycle {frame_index} failed, skipping: {err}");
                        shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                        shared.frames_done.fetch_add(1, Ordering::Relaxed);
                        let mut pipeline = lock_pipeline(&pipeline);
                        pipeline.metrics_mut().frames_skipped += 1;
                    }
                }
                frame_index += 1;
            }
        }
    }
}
