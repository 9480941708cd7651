use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kspy_core::{DetectorBackend, Gallery, GalleryBuilder, OnnxFaceModels};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod live;

use config::Config;

#[derive(Parser)]
#[command(name = "kspy", about = "KSpy face recognition and live tracking")]
struct Cli {
    /// Data root holding training/, output/ and validation/ (overrides KSPY_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Gallery file (overrides KSPY_GALLERY_PATH)
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,

    /// Match tolerance; lower is stricter (overrides KSPY_TOLERANCE)
    #[arg(long, global = true)]
    tolerance: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the training, output and validation directories
    Init,
    /// Build the face gallery from training/<name>/<image> files
    Train {
        /// Detector backend: fast (hog) or accurate (cnn)
        #[arg(short = 'm', long = "model")]
        backend: Option<DetectorBackend>,
    },
    /// Recognize faces in every image under validation/
    Validate {
        #[arg(short = 'm', long = "model")]
        backend: Option<DetectorBackend>,
    },
    /// Recognize faces in a single image
    Analyze {
        /// Image to analyze
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(short = 'm', long = "model")]
        backend: Option<DetectorBackend>,
        /// Annotated output (default: output/<name>.png)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Print the recognized faces as JSON
        #[arg(long)]
        json: bool,
    },
    /// Track and identify faces from a camera
    Live {
        /// V4L2 device (overrides KSPY_CAMERA_DEVICE)
        #[arg(long)]
        device: Option<String>,
        /// Stop after N displayed frames
        #[arg(long)]
        frames: Option<u64>,
        /// Latest annotated frame (default: output/live.png)
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(short = 'm', long = "model")]
        backend: Option<DetectorBackend>,
    },
    /// Show the gallery summary
    Info,
}

#[derive(Serialize)]
struct GalleryInfo<'a> {
    path: &'a Path,
    entries: usize,
    labels: Vec<LabelInfo<'a>>,
}

#[derive(Serialize)]
struct LabelInfo<'a> {
    name: &'a str,
    encodings: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        if std::env::var_os("KSPY_GALLERY_PATH").is_none() {
            config.gallery_path = dir.join("output").join("encodings.bin");
        }
        config.data_dir = dir;
    }
    if let Some(path) = cli.gallery {
        config.gallery_path = path;
    }
    if let Some(tolerance) = cli.tolerance {
        config.tolerance = tolerance;
    }
    config.validate()?;

    match cli.command {
        Commands::Init => init(&config),
        Commands::Train { backend } => train(&config, backend.unwrap_or(config.backend)).await,
        Commands::Validate { backend } => validate(&config, backend.unwrap_or(config.backend)).await,
        Commands::Analyze {
            file,
            backend,
            output,
            json,
        } => {
            let output = output.unwrap_or_else(|| default_output(&config, &file));
            analyze(&config, file, output, backend.unwrap_or(config.backend), json).await
        }
        Commands::Live {
            device,
            frames,
            snapshot,
            backend,
        } => {
            if let Some(backend) = backend {
                config.backend = backend;
            }
            let options = live::LiveOptions {
                device: device.unwrap_or_else(|| config.camera_device.clone()),
                max_frames: frames,
                snapshot: snapshot.unwrap_or_else(|| config.output_dir().join("live.png")),
            };
            run_live(config, options).await
        }
        Commands::Info => info(&config),
    }
}

fn init(config: &Config) -> Result<()> {
    for dir in [config.training_dir(), config.output_dir(), config.validation_dir()] {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        println!("{}", dir.display());
    }
    Ok(())
}

async fn train(config: &Config, backend: DetectorBackend) -> Result<()> {
    let config = config.clone();
    let stats = tokio::task::spawn_blocking(move || -> Result<_> {
        let models = OnnxFaceModels::load(&config.model_paths(), &[backend]).context("loading face models")?;
        let training = config.training_dir();
        let (gallery, stats) = GalleryBuilder::new(&models, backend)
            .build(&training)
            .with_context(|| format!("building gallery from {}", training.display()))?;
        gallery.save(&config.gallery_path)?;
        Ok(stats)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn validate(config: &Config, backend: DetectorBackend) -> Result<()> {
    let handle = engine::spawn_engine(config, backend)?;
    let entries = handle
        .validate(
            config.validation_dir(),
            config.output_dir().join("validation"),
            backend,
        )
        .await?;

    let failed = entries.iter().filter(|e| e.outcome.is_err()).count();
    for entry in &entries {
        match &entry.outcome {
            Ok(result) => println!(
                "{}: {}",
                entry.path.display(),
                names(&result.faces).join(", ")
            ),
            Err(e) => println!("{}: error: {e}", entry.path.display()),
        }
    }
    tracing::info!(files = entries.len(), failed, "validation finished");
    Ok(())
}

async fn analyze(
    config: &Config,
    file: PathBuf,
    output: PathBuf,
    backend: DetectorBackend,
    json: bool,
) -> Result<()> {
    let handle = engine::spawn_engine(config, backend)?;
    let result = handle.analyze(file.clone(), output, backend).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result.faces)?);
    } else {
        println!("{}: {}", file.display(), names(&result.faces).join(", "));
        println!("annotated image: {}", result.output.display());
    }
    Ok(())
}

async fn run_live(config: Config, options: live::LiveOptions) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));

    let session = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || live::run(&config, &options, stop))
    };
    tokio::pin!(session);

    let summary = tokio::select! {
        joined = &mut session => joined??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received; stopping live session");
            stop.store(true, Ordering::Release);
            session.await??
        }
    };

    println!(
        "{} frames in {:.1}s",
        summary.frames,
        summary.elapsed.as_secs_f32()
    );
    Ok(())
}

fn info(config: &Config) -> Result<()> {
    let gallery = Gallery::load(&config.gallery_path)?;
    let summary = GalleryInfo {
        path: &config.gallery_path,
        entries: gallery.len(),
        labels: gallery
            .labels()
            .into_iter()
            .map(|(name, encodings)| LabelInfo { name, encodings })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn names(faces: &[kspy_core::RecognizedFace]) -> Vec<String> {
    if faces.is_empty() {
        return vec!["no faces".to_string()];
    }
    faces.iter().map(|f| f.identity.to_string()).collect()
}

fn default_output(config: &Config, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "analysis".to_string());
    config.output_dir().join(format!("{stem}.png"))
}
