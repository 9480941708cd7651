//! Live tracking engine.
//!
//! A display loop calls [`LiveTracker::tick`] once per frame. Every
//! `detection_every` frames a detection pass is queued on the worker pool;
//! every `identification_every` frames an identification pass is queued
//! against the goal boxes known at that moment. Neither pass is awaited.
//! Completed passes replace the shared goal boxes or names wholesale, and
//! each tick eases the displayed boxes toward the latest goals using the
//! wall-clock time since the previous tick.
//!
//! Names are associated with boxes by list position only. When faces enter,
//! leave or reorder between a detection pass and the identification pass
//! that labelled it, a name can be shown for the wrong face.

use crate::gallery::Gallery;
use crate::matcher::VoteMatcher;
use crate::models::{encode_checked, FaceModels};
use crate::pool::WorkerPool;
use crate::types::{DetectorBackend, FaceBox, Identity, TrackedBox};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_DETECTION_EVERY: u64 = 10;
pub const DEFAULT_IDENTIFICATION_EVERY: u64 = 60;
pub const DEFAULT_MOVE_SPEED: f32 = 2.0;
pub const DEFAULT_TICK: Duration = Duration::from_millis(30);

#[derive(Error, Debug, PartialEq)]
pub enum TrackerError {
    #[error("invalid tracker config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Queue a detection pass every N displayed frames.
    pub detection_every: u64,
    /// Queue an identification pass every M displayed frames (M > N).
    pub identification_every: u64,
    /// Easing speed; the fraction of the remaining distance covered per
    /// second of elapsed time.
    pub speed: f32,
    pub backend: DetectorBackend,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            detection_every: DEFAULT_DETECTION_EVERY,
            identification_every: DEFAULT_IDENTIFICATION_EVERY,
            speed: DEFAULT_MOVE_SPEED,
            backend: DetectorBackend::Fast,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.detection_every == 0 || self.identification_every == 0 {
            return Err(TrackerError::InvalidConfig("cadences must be at least 1 frame".into()));
        }
        if self.identification_every <= self.detection_every {
            return Err(TrackerError::InvalidConfig(format!(
                "identification cadence ({}) must be longer than detection cadence ({})",
                self.identification_every, self.detection_every
            )));
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(TrackerError::InvalidConfig(format!(
                "move speed must be a finite non-negative number, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

/// A value that is only ever replaced whole.
///
/// Readers take a cheap `Arc` snapshot; writers swap in a new value under a
/// short lock, so no reader ever sees a partial update.
pub struct StateCell<T> {
    inner: Mutex<Arc<T>>,
}

impl<T> StateCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Arc::new(value)),
        }
    }

    pub fn snapshot(&self) -> Arc<T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, value: T) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(value);
    }
}

impl<T: Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// State written by background passes and read by the display loop.
#[derive(Default)]
pub struct SharedState {
    /// Goal boxes from the most recent completed detection pass.
    pub goals: StateCell<Vec<FaceBox>>,
    /// Names from the most recent completed identification pass.
    pub names: StateCell<Vec<Identity>>,
    stopped: AtomicBool,
}

impl SharedState {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Ease one box toward its goal.
///
/// Each coordinate moves by `(goal - current) * elapsed * speed`, with the
/// step fraction capped at 1 so a long stall lands on the goal instead of
/// overshooting it.
pub fn interpolate(current: &TrackedBox, goal: &FaceBox, elapsed_secs: f32, speed: f32) -> TrackedBox {
    let t = (elapsed_secs * speed).clamp(0.0, 1.0);
    if t >= 1.0 {
        return TrackedBox::from(*goal);
    }
    let ease = |cur: f32, target: i32| cur + (target as f32 - cur) * t;
    TrackedBox {
        top: ease(current.top, goal.top),
        right: ease(current.right, goal.right),
        bottom: ease(current.bottom, goal.bottom),
        left: ease(current.left, goal.left),
    }
}

/// Compute this tick's displayed boxes: one per goal.
///
/// A goal with a displayed box at the same index is eased toward; a goal
/// without one (new face, or the list grew) snaps straight to the goal.
/// `elapsed` is `None` on the first tick, which leaves existing boxes as-is.
pub fn step_boxes(
    displayed: &[TrackedBox],
    goals: &[FaceBox],
    elapsed: Option<Duration>,
    speed: f32,
) -> Vec<TrackedBox> {
    goals
        .iter()
        .enumerate()
        .map(|(i, goal)| match (displayed.get(i), elapsed) {
            (Some(current), Some(dt)) => interpolate(current, goal, dt.as_secs_f32(), speed),
            (Some(current), None) => *current,
            (None, _) => TrackedBox::from(*goal),
        })
        .collect()
}

/// Which passes a tick queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scheduled {
    pub detection: bool,
    pub identification: bool,
}

/// What to draw for one displayed frame.
#[derive(Debug, Clone)]
pub struct TickOutput {
    /// 1-based index of this displayed frame.
    pub frame_index: u64,
    pub boxes: Vec<TrackedBox>,
    pub names: Arc<Vec<Identity>>,
    pub scheduled: Scheduled,
}

/// Per-session tracking state machine.
///
/// The tracker itself is owned by the display loop; only [`SharedState`] is
/// touched by background passes.
pub struct LiveTracker {
    config: TrackerConfig,
    models: Arc<dyn FaceModels>,
    gallery: Arc<Gallery>,
    matcher: VoteMatcher,
    pool: WorkerPool,
    shared: Arc<SharedState>,
    displayed: Vec<TrackedBox>,
    frame_count: u64,
    last_tick: Option<Instant>,
}

impl LiveTracker {
    pub fn new(
        config: TrackerConfig,
        models: Arc<dyn FaceModels>,
        gallery: Arc<Gallery>,
        matcher: VoteMatcher,
        pool: WorkerPool,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self {
            config,
            models,
            gallery,
            matcher,
            pool,
            shared: Arc::new(SharedState::default()),
            displayed: Vec::new(),
            frame_count: 0,
            last_tick: None,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Advance one displayed frame. Never waits on background passes.
    pub fn tick(&mut self, frame: &RgbImage, now: Instant) -> TickOutput {
        let elapsed = self.last_tick.map(|prev| now.saturating_duration_since(prev));
        self.last_tick = Some(now);
        self.frame_count += 1;

        let scheduled = self.schedule_passes(frame);

        let goals = self.shared.goals.snapshot();
        self.displayed = step_boxes(&self.displayed, &goals, elapsed, self.config.speed);

        TickOutput {
            frame_index: self.frame_count,
            boxes: self.displayed.clone(),
            names: self.shared.names.snapshot(),
            scheduled,
        }
    }

    /// Stop scheduling passes. Passes already running finish and their
    /// results are dropped.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            tracing::info!(
                frames = self.frame_count,
                in_flight = self.pool.in_flight(),
                "live tracking stopped"
            );
        }
    }

    fn schedule_passes(&self, frame: &RgbImage) -> Scheduled {
        if self.shared.is_stopped() {
            return Scheduled::default();
        }

        let n = self.frame_count;
        let mut scheduled = Scheduled {
            detection: n % self.config.detection_every == 0,
            identification: n % self.config.identification_every == 0,
        };
        if !scheduled.detection && !scheduled.identification {
            return scheduled;
        }

        let frame = Arc::new(frame.clone());
        if scheduled.detection {
            scheduled.detection = self.submit_detection(n, Arc::clone(&frame));
        }
        if scheduled.identification {
            scheduled.identification = self.submit_identification(n, frame);
        }
        scheduled
    }

    fn submit_detection(&self, frame_index: u64, frame: Arc<RgbImage>) -> bool {
        let models = Arc::clone(&self.models);
        let shared = Arc::clone(&self.shared);
        let backend = self.config.backend;

        tracing::trace!(frame = frame_index, pass = "detection", "scheduling");
        self.pool.submit(move || match models.detect(&frame, backend) {
            Ok(boxes) => {
                if shared.is_stopped() {
                    tracing::debug!(frame = frame_index, "discarding detection after stop");
                    return;
                }
                tracing::trace!(frame = frame_index, faces = boxes.len(), "detection pass complete");
                shared.goals.replace(boxes);
            }
            Err(e) => {
                tracing::warn!(frame = frame_index, error = %e, "detection pass failed; keeping previous boxes");
            }
        })
    }

    fn submit_identification(&self, frame_index: u64, frame: Arc<RgbImage>) -> bool {
        let models = Arc::clone(&self.models);
        let shared = Arc::clone(&self.shared);
        let gallery = Arc::clone(&self.gallery);
        let matcher = self.matcher;
        // Boxes as known now, not when the pass runs.
        let boxes = self.shared.goals.snapshot();

        tracing::trace!(frame = frame_index, pass = "identification", faces = boxes.len(), "scheduling");
        self.pool.submit(move || {
            let names = if boxes.is_empty() {
                Ok(Vec::new())
            } else {
                encode_checked(models.as_ref(), &frame, &boxes)
                    .map(|encodings| matcher.identify_all(&encodings, &gallery))
            };
            match names {
                Ok(names) => {
                    if shared.is_stopped() {
                        tracing::debug!(frame = frame_index, "discarding identification after stop");
                        return;
                    }
                    tracing::trace!(frame = frame_index, faces = names.len(), "identification pass complete");
                    shared.names.replace(names);
                }
                Err(e) => {
                    tracing::warn!(frame = frame_index, error = %e, "identification pass failed; keeping previous names");
                }
            }
        })
    }
}

impl Drop for LiveTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(top: f32, right: f32, bottom: f32, left: f32) -> TrackedBox {
        TrackedBox {
            top,
            right,
            bottom,
            left,
        }
    }

    #[test]
    fn test_zero_elapsed_is_identity() {
        let current = tracked(3.25, 71.5, 40.125, 9.75);
        let out = interpolate(&current, &FaceBox::new(100, 200, 300, 50), 0.0, 2.0);
        assert_eq!(out, current);
    }

    #[test]
    fn test_interpolation_moves_fraction_of_distance() {
        let current = TrackedBox::from(FaceBox::new(0, 40, 40, 0));
        let out = interpolate(&current, &FaceBox::new(10, 50, 50, 10), 0.25, 2.0);
        assert_eq!(out, tracked(5.0, 45.0, 45.0, 5.0));
    }

    #[test]
    fn test_interpolation_converges_without_reaching() {
        let goal = FaceBox::new(100, 300, 200, 50);
        let mut current = TrackedBox::from(FaceBox::new(0, 0, 0, 0));
        let mut distance = current.distance_to(&goal);
        for _ in 0..20 {
            current = interpolate(&current, &goal, 0.03, 2.0);
            let next = current.distance_to(&goal);
            assert!(next < distance, "{next} !< {distance}");
            assert!(next > 0.0);
            distance = next;
        }
    }

    #[test]
    fn test_interpolation_lands_on_goal_when_step_saturates() {
        let goal = FaceBox::new(10, 50, 50, 10);
        let current = TrackedBox::from(FaceBox::new(0, 40, 40, 0));
        assert_eq!(interpolate(&current, &goal, 0.5, 2.0), TrackedBox::from(goal));
        assert_eq!(interpolate(&current, &goal, 1.0, 2.0), TrackedBox::from(goal));
    }

    #[test]
    fn test_step_boxes_snaps_new_faces() {
        let displayed = vec![TrackedBox::from(FaceBox::new(0, 40, 40, 0))];
        let goals = vec![FaceBox::new(10, 50, 50, 10), FaceBox::new(100, 150, 150, 100)];
        let out = step_boxes(&displayed, &goals, Some(Duration::from_millis(250)), 2.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], tracked(5.0, 45.0, 45.0, 5.0));
        assert_eq!(out[1], TrackedBox::from(goals[1]));
    }

    #[test]
    fn test_step_boxes_follows_goal_count() {
        let displayed = vec![
            TrackedBox::from(FaceBox::new(0, 40, 40, 0)),
            TrackedBox::from(FaceBox::new(0, 90, 40, 50)),
        ];
        let shrunk = step_boxes(&displayed, &[FaceBox::new(0, 40, 40, 0)], Some(Duration::from_millis(30)), 2.0);
        assert_eq!(shrunk.len(), 1);

        // Regrowing after a shrink snaps; the old second box is gone.
        let goals = [FaceBox::new(0, 40, 40, 0), FaceBox::new(200, 260, 260, 200)];
        let regrown = step_boxes(&shrunk, &goals, Some(Duration::from_millis(30)), 2.0);
        assert_eq!(regrown[1], TrackedBox::from(goals[1]));
    }

    #[test]
    fn test_step_boxes_first_tick_has_no_motion() {
        let displayed = vec![tracked(1.5, 2.5, 3.5, 0.5)];
        let out = step_boxes(&displayed, &[FaceBox::new(10, 10, 10, 10)], None, 2.0);
        assert_eq!(out, displayed);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());

        let defaults = TrackerConfig::default();
        let zero_cadence = TrackerConfig {
            detection_every: 0,
            ..defaults
        };
        assert!(zero_cadence.validate().is_err());

        let same_cadence = TrackerConfig {
            identification_every: defaults.detection_every,
            ..defaults
        };
        assert!(same_cadence.validate().is_err());

        let bad_speed = TrackerConfig {
            speed: f32::NAN,
            ..defaults
        };
        assert!(bad_speed.validate().is_err());
    }

    #[test]
    fn test_state_cell_replaces_whole_value() {
        let cell = StateCell::new(vec![1, 2, 3]);
        let before = cell.snapshot();
        cell.replace(vec![9]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*cell.snapshot(), vec![9]);
    }
}
