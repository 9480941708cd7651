use kspy_core::{
    Analysis, Annotator, DetectorBackend, FaceModels, Gallery, GalleryError, ModelError, OnnxFaceModels,
    PipelineError, RecognizedFace, StillImagePipeline, VoteMatcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("{0}")]
    Gallery(#[from] GalleryError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to write {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of analyzing one file.
pub struct AnalyzeResult {
    pub faces: Vec<RecognizedFace>,
    /// Where the annotated copy was written.
    pub output: PathBuf,
}

/// Per-file outcome of a validation run.
pub struct ValidationEntry {
    pub path: PathBuf,
    pub outcome: Result<AnalyzeResult, String>,
}

/// Messages sent from the command surface to the engine thread.
enum EngineRequest {
    Analyze {
        path: PathBuf,
        output: PathBuf,
        backend: DetectorBackend,
        reply: oneshot::Sender<Result<AnalyzeResult, EngineError>>,
    },
    Validate {
        root: PathBuf,
        out_dir: PathBuf,
        backend: DetectorBackend,
        reply: oneshot::Sender<Result<Vec<ValidationEntry>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Analyze an image file and write the annotated copy to `output`.
    pub async fn analyze(
        &self,
        path: PathBuf,
        output: PathBuf,
        backend: DetectorBackend,
    ) -> Result<AnalyzeResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                path,
                output,
                backend,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Analyze every file below `root`, mirroring annotated copies into
    /// `out_dir`.
    pub async fn validate(
        &self,
        root: PathBuf,
        out_dir: PathBuf,
        backend: DetectorBackend,
    ) -> Result<Vec<ValidationEntry>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Validate {
                root,
                out_dir,
                backend,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the ONNX models and the gallery, then spawn the engine.
///
/// Fails fast if the gallery or a required model is unavailable.
pub fn spawn_engine(config: &Config, backend: DetectorBackend) -> Result<EngineHandle, EngineError> {
    let gallery = Gallery::load(&config.gallery_path)?;
    tracing::info!(path = %config.gallery_path.display(), entries = gallery.len(), "gallery loaded");

    let models = OnnxFaceModels::load(&config.model_paths(), &[backend])?;
    tracing::info!(dir = %config.model_dir.display(), %backend, "face models loaded");

    let annotator = Annotator::from_font_path(config.font_path());
    spawn_with(
        Arc::new(models),
        gallery,
        VoteMatcher::new(config.tolerance),
        annotator,
    )
}

/// Spawn the engine thread over already-loaded resources.
pub fn spawn_with(
    models: Arc<dyn FaceModels>,
    gallery: Gallery,
    matcher: VoteMatcher,
    annotator: Annotator,
) -> Result<EngineHandle, EngineError> {
    let pipeline = StillImagePipeline::new(models, Arc::new(gallery), matcher, Arc::new(annotator));
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("kspy-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze {
                        path,
                        output,
                        backend,
                        reply,
                    } => {
                        let result = run_analyze(&pipeline, &path, &output, backend);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Validate {
                        root,
                        out_dir,
                        backend,
                        reply,
                    } => {
                        let result = run_validate(&pipeline, &root, &out_dir, backend);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_analyze(
    pipeline: &StillImagePipeline,
    path: &Path,
    output: &Path,
    backend: DetectorBackend,
) -> Result<AnalyzeResult, EngineError> {
    let analysis = pipeline.analyze_path(path, backend)?;
    save_analysis(analysis, output)
}

fn run_validate(
    pipeline: &StillImagePipeline,
    root: &Path,
    out_dir: &Path,
    backend: DetectorBackend,
) -> Result<Vec<ValidationEntry>, EngineError> {
    let mut entries = Vec::new();
    pipeline.validate_dir(root, backend, |path, result| {
        let rel = path.strip_prefix(root).unwrap_or(path);
        let output = validation_output(out_dir, rel);
        let outcome = result
            .map_err(EngineError::from)
            .and_then(|analysis| save_analysis(analysis, &output))
            .map_err(|e| e.to_string());
        match &outcome {
            Ok(r) => tracing::info!(path = %path.display(), faces = r.faces.len(), "validated"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "validation failed"),
        }
        entries.push(ValidationEntry {
            path: path.to_path_buf(),
            outcome,
        });
    })?;
    Ok(entries)
}

/// `a.jpg` becomes `a.jpg.png`, so inputs differing only by extension
/// never share an output.
fn validation_output(out_dir: &Path, rel: &Path) -> PathBuf {
    let mut name = out_dir.join(rel).into_os_string();
    name.push(".png");
    PathBuf::from(name)
}

fn save_analysis(analysis: Analysis, output: &Path) -> Result<AnalyzeResult, EngineError> {
    let save_err = |source: image::ImageError| EngineError::Save {
        path: output.to_path_buf(),
        source,
    };
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| save_err(image::ImageError::IoError(e)))?;
    }
    analysis.image.save(output).map_err(save_err)?;
    Ok(AnalyzeResult {
        faces: analysis.faces,
        output: output.to_path_buf(),
    })
}
