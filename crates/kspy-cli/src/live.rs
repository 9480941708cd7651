//! Live camera session: capture, track, draw, publish a snapshot.

use anyhow::{Context, Result};
use kspy_core::{Annotator, FaceModels, Gallery, LiveTracker, OnnxFaceModels, TickOutput, VoteMatcher, WorkerPool};
use kspy_hw::{Camera, CameraError, Frame, FrameStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;

/// Consecutive capture failures tolerated before the session gives up.
const MAX_CAPTURE_FAILURES: u32 = 30;

pub struct LiveOptions {
    pub device: String,
    /// Stop after this many displayed frames.
    pub max_frames: Option<u64>,
    /// Where the latest annotated frame is written.
    pub snapshot: PathBuf,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy)]
pub struct LiveSummary {
    pub frames: u64,
    pub elapsed: Duration,
}

/// Run a live session until `stop` is raised or the frame limit is hit.
///
/// Blocking; run it on a dedicated thread. The camera, gallery and models
/// are all opened before the first frame so a missing resource fails the
/// session immediately.
pub fn run(config: &Config, options: &LiveOptions, stop: Arc<AtomicBool>) -> Result<LiveSummary> {
    let camera = match Camera::open(&options.device) {
        Ok(camera) => camera,
        Err(e) => {
            let available: Vec<String> = Camera::list_devices()
                .into_iter()
                .map(|d| format!("{} ({})", d.path, d.name))
                .collect();
            tracing::error!(device = %options.device, ?available, "camera unavailable");
            return Err(anyhow::Error::new(e).context(format!("opening camera {}", options.device)));
        }
    };

    let gallery = Gallery::load(&config.gallery_path).context("loading gallery")?;
    let models = OnnxFaceModels::load(&config.model_paths(), &[config.backend]).context("loading face models")?;
    let pool = WorkerPool::new("kspy-live", config.workers).context("starting worker pool")?;

    let mut tracker = LiveTracker::new(
        config.tracker_config(),
        Arc::new(models) as Arc<dyn FaceModels>,
        Arc::new(gallery),
        VoteMatcher::new(config.tolerance),
        pool,
    )?;
    let annotator = Annotator::from_font_path(config.font_path());

    tracing::info!(
        device = %options.device,
        width = camera.width,
        height = camera.height,
        tick_ms = config.tick_ms,
        detection_every = config.detection_every,
        identification_every = config.identification_every,
        workers = tracker.pool().size(),
        "live session started"
    );

    let mut capture = Capture::new(camera.stream()?);
    let period = config.tick_period();
    let started = Instant::now();

    while !stop.load(Ordering::Acquire) {
        if options.max_frames.is_some_and(|max| tracker.frame_count() >= max) {
            break;
        }
        let tick_start = Instant::now();

        if let Some(frame) = capture.next_frame()? {
            let out = tracker.tick(&frame.image, tick_start);
            let mut display = frame.image;
            annotator.draw_live_overlay(&mut display, &out.boxes, &out.names);
            if let Err(e) = publish_snapshot(&display, &options.snapshot) {
                tracing::warn!(frame = out.frame_index, error = %e, "failed to write snapshot");
            }
            log_tick(&out, frame.sequence);
        }

        if let Some(rest) = period.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    tracker.stop();
    let summary = LiveSummary {
        frames: tracker.frame_count(),
        elapsed: started.elapsed(),
    };
    tracing::info!(frames = summary.frames, elapsed = ?summary.elapsed, "live session ended");
    Ok(summary)
}

/// Source of camera frames for the session loop.
trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        FrameStream::next_frame(self)
    }
}

/// Skips failed captures until too many happen in a row.
struct Capture<S> {
    source: S,
    failures: u32,
}

impl<S: FrameSource> Capture<S> {
    fn new(source: S) -> Self {
        Self { source, failures: 0 }
    }

    /// `Ok(None)` means this tick has no frame; the session carries on.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.source.next_frame() {
            Ok(frame) => {
                self.failures = 0;
                Ok(Some(frame))
            }
            Err(e) if self.failures + 1 >= MAX_CAPTURE_FAILURES => {
                let context = format!("{MAX_CAPTURE_FAILURES} consecutive capture failures");
                Err(anyhow::Error::new(e).context(context))
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(failures = self.failures, error = %e, "frame capture failed, skipping tick");
                Ok(None)
            }
        }
    }
}

fn log_tick(out: &TickOutput, sequence: u32) {
    if out.scheduled.detection || out.scheduled.identification {
        tracing::debug!(
            frame = out.frame_index,
            sequence,
            boxes = out.boxes.len(),
            names = out.names.len(),
            detection = out.scheduled.detection,
            identification = out.scheduled.identification,
            "tick"
        );
    }
}

/// Write the frame next to `path` and rename it into place so readers never
/// see a partial image.
fn publish_snapshot(image: &image::RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp.png");
    image.save(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
