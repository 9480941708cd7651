//! Detection and encoding capability seam.
//!
//! Everything above this module talks to [`FaceModels`]; the ONNX-backed
//! [`OnnxFaceModels`] is the production implementation.

use crate::detector::{self, FaceDetector};
use crate::encoder::FaceEncoder;
use crate::types::{DetectorBackend, Embedding, FaceBox};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0} (download from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("detector backend '{0}' is not loaded")]
    BackendUnavailable(DetectorBackend),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("encoder returned {embeddings} embeddings for {boxes} boxes")]
    EncodingMismatch { boxes: usize, embeddings: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detection and encoding, consumed as a black box.
pub trait FaceModels: Send + Sync {
    /// Locate faces in an image.
    fn detect(&self, image: &RgbImage, backend: DetectorBackend) -> Result<Vec<FaceBox>, ModelError>;

    /// One embedding per box, same order.
    fn encode(&self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>, ModelError>;
}

/// Detect then encode, checking the one-embedding-per-box contract.
pub fn detect_and_encode(
    models: &dyn FaceModels,
    image: &RgbImage,
    backend: DetectorBackend,
) -> Result<Vec<(FaceBox, Embedding)>, ModelError> {
    let boxes = models.detect(image, backend)?;
    if boxes.is_empty() {
        return Ok(Vec::new());
    }
    let encodings = encode_checked(models, image, &boxes)?;
    Ok(boxes.into_iter().zip(encodings).collect())
}

/// Encode and verify the output length matches the box count.
pub fn encode_checked(
    models: &dyn FaceModels,
    image: &RgbImage,
    boxes: &[FaceBox],
) -> Result<Vec<Embedding>, ModelError> {
    let encodings = models.encode(image, boxes)?;
    if encodings.len() != boxes.len() {
        return Err(ModelError::EncodingMismatch {
            boxes: boxes.len(),
            embeddings: encodings.len(),
        });
    }
    Ok(encodings)
}

/// Locations of the ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub fast_detector: PathBuf,
    pub accurate_detector: PathBuf,
    pub encoder: PathBuf,
}

impl ModelPaths {
    /// Standard insightface file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            fast_detector: dir.join("det_500m.onnx"),
            accurate_detector: dir.join("det_10g.onnx"),
            encoder: dir.join("w600k_r50.onnx"),
        }
    }

    fn detector(&self, backend: DetectorBackend) -> &Path {
        match backend {
            DetectorBackend::Fast => &self.fast_detector,
            DetectorBackend::Accurate => &self.accurate_detector,
        }
    }
}

/// SCRFD detectors plus the ArcFace encoder, shareable across threads.
///
/// Each session sits behind its own lock, so detection on one backend does
/// not wait on encoding.
pub struct OnnxFaceModels {
    fast: Option<Mutex<FaceDetector>>,
    accurate: Option<Mutex<FaceDetector>>,
    encoder: Mutex<FaceEncoder>,
}

impl OnnxFaceModels {
    /// Load the encoder and every detector whose file exists.
    ///
    /// Fails fast when the encoder or any backend in `required` is missing.
    pub fn load(paths: &ModelPaths, required: &[DetectorBackend]) -> Result<Self, ModelError> {
        let load_backend = |backend: DetectorBackend| -> Result<Option<Mutex<FaceDetector>>, ModelError> {
            let path = paths.detector(backend);
            if !path.exists() && !required.contains(&backend) {
                tracing::debug!(%backend, path = %path.display(), "detector model absent; backend disabled");
                return Ok(None);
            }
            let detector = FaceDetector::load(path, detector::input_size_for(backend))?;
            Ok(Some(Mutex::new(detector)))
        };

        let fast = load_backend(DetectorBackend::Fast)?;
        let accurate = load_backend(DetectorBackend::Accurate)?;
        let encoder = Mutex::new(FaceEncoder::load(&paths.encoder)?);

        Ok(Self {
            fast,
            accurate,
            encoder,
        })
    }
}

impl FaceModels for OnnxFaceModels {
    fn detect(&self, image: &RgbImage, backend: DetectorBackend) -> Result<Vec<FaceBox>, ModelError> {
        let slot = match backend {
            DetectorBackend::Fast => &self.fast,
            DetectorBackend::Accurate => &self.accurate,
        };
        let detector = slot
            .as_ref()
            .ok_or(ModelError::BackendUnavailable(backend))?;
        lock_session(detector, "detector").detect(image)
    }

    fn encode(&self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>, ModelError> {
        lock_session(&self.encoder, "encoder").encode(image, boxes)
    }
}

/// Lock an inference session, taking it back if an earlier pass panicked
/// while holding it. Sessions hold no cross-call state that a panic could
/// leave half-written.
fn lock_session<'a, T>(session: &'a Mutex<T>, kind: &'static str) -> MutexGuard<'a, T> {
    session.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(session = kind, "recovering session after a panicked inference");
        session.clear_poison();
        poisoned.into_inner()
    })
}
