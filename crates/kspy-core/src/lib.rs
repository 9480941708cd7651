//! kspy-core: face recognition engine.
//!
//! Builds a labeled gallery of face embeddings, recognizes faces in still
//! images against it, and tracks faces in a live frame stream with smoothed
//! boxes. Detection (SCRFD) and encoding (ArcFace) run on ONNX Runtime
//! behind the [`FaceModels`] seam.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod tracker;
pub mod types;

pub use annotate::Annotator;
pub use gallery::{BuildStats, Gallery, GalleryBuilder, GalleryError};
pub use matcher::{VoteMatcher, DEFAULT_TOLERANCE};
pub use models::{FaceModels, ModelError, ModelPaths, OnnxFaceModels};
pub use pipeline::{Analysis, PipelineError, RecognizedFace, StillImagePipeline};
pub use pool::WorkerPool;
pub use tracker::{LiveTracker, TickOutput, TrackerConfig, TrackerError};
pub use types::{DetectorBackend, Embedding, FaceBox, Identity, TrackedBox};
