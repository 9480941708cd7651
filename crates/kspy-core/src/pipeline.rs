//! Still-image recognition: detect → encode → match → annotate.

use crate::annotate::Annotator;
use crate::gallery::{self, Gallery};
use crate::matcher::VoteMatcher;
use crate::models::{self, FaceModels, ModelError};
use crate::types::{DetectorBackend, FaceBox, Identity};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("face models: {0}")]
    Model(#[from] ModelError),
    #[error("failed to read directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One face found in an analyzed image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedFace {
    pub face_box: FaceBox,
    pub identity: Identity,
}

/// Result of analyzing one image.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub faces: Vec<RecognizedFace>,
    /// Annotated copy of the input.
    pub image: RgbImage,
}

/// Synchronous single-image pipeline over a loaded gallery.
pub struct StillImagePipeline {
    models: Arc<dyn FaceModels>,
    gallery: Arc<Gallery>,
    matcher: VoteMatcher,
    annotator: Arc<Annotator>,
}

impl StillImagePipeline {
    pub fn new(
        models: Arc<dyn FaceModels>,
        gallery: Arc<Gallery>,
        matcher: VoteMatcher,
        annotator: Arc<Annotator>,
    ) -> Self {
        Self {
            models,
            gallery,
            matcher,
            annotator,
        }
    }

    /// Recognize and annotate every face. The input is left untouched.
    pub fn analyze(&self, image: &RgbImage, backend: DetectorBackend) -> Result<Analysis, PipelineError> {
        let started = Instant::now();
        let detected = models::detect_and_encode(self.models.as_ref(), image, backend)?;

        let mut annotated = image.clone();
        let faces: Vec<RecognizedFace> = detected
            .into_iter()
            .map(|(face_box, encoding)| {
                let identity = self.matcher.identify(&encoding, &self.gallery);
                self.annotator.annotate_face(&mut annotated, &face_box, &identity);
                RecognizedFace { face_box, identity }
            })
            .collect();

        tracing::debug!(
            faces = faces.len(),
            known = faces.iter().filter(|f| f.identity.is_known()).count(),
            %backend,
            elapsed = ?started.elapsed(),
            "image analyzed"
        );

        Ok(Analysis {
            faces,
            image: annotated,
        })
    }

    /// Decode an image file and analyze it.
    pub fn analyze_path(&self, path: &Path, backend: DetectorBackend) -> Result<Analysis, PipelineError> {
        let image = image::open(path)
            .map_err(|source| PipelineError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        self.analyze(&image, backend)
    }

    /// Run the pipeline over every file below `root`, in sorted order.
    ///
    /// Each outcome is handed to `on_result`; a failing file does not stop
    /// the walk. Only an unreadable directory is returned as an error.
    pub fn validate_dir<F>(&self, root: &Path, backend: DetectorBackend, mut on_result: F) -> Result<usize, PipelineError>
    where
        F: FnMut(&Path, Result<Analysis, PipelineError>),
    {
        let mut visited = 0;
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut subdirs = Vec::new();
            let entries = gallery::sorted_entries(&dir).map_err(|source| PipelineError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                if entry.is_dir() {
                    subdirs.push(entry);
                } else if entry.is_file() {
                    visited += 1;
                    let result = self.analyze_path(&entry, backend);
                    if let Err(e) = &result {
                        tracing::warn!(path = %entry.display(), error = %e, "validation file failed");
                    }
                    on_result(&entry, result);
                }
            }
            // Reverse so the stack pops subdirectories in sorted order.
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(visited)
    }
}
