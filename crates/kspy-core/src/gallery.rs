//! Labeled embedding gallery: building, persistence, lookup.
//!
//! A gallery is two parallel sequences, `names[i]` labelling
//! `encodings[i]`. It is built offline from a training directory whose
//! immediate subdirectories are labels, serialized to a single binary file,
//! and treated as read-only during recognition.

use crate::models::{self, FaceModels, ModelError};
use crate::types::{DetectorBackend, Embedding};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File magic prefixed to every serialized gallery.
const GALLERY_MAGIC: [u8; 8] = *b"KSPYGAL1";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery not found: {0} (run `kspy train` first)")]
    NotFound(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable training image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("corrupt gallery {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("gallery encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("face models failed on {path}: {source}")]
    Model {
        path: PathBuf,
        #[source]
        source: ModelError,
    },
}

impl GalleryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        GalleryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ordered collection of `(label, embedding)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    names: Vec<String>,
    encodings: Vec<Embedding>,
}

impl Gallery {
    /// Build from parallel sequences; they must have equal length.
    pub fn from_parts(names: Vec<String>, encodings: Vec<Embedding>) -> Option<Self> {
        (names.len() == encodings.len()).then_some(Self { names, encodings })
    }

    pub fn push(&mut self, name: String, encoding: Embedding) {
        self.names.push(name);
        self.encodings.push(encoding);
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn encodings(&self) -> &[Embedding] {
        &self.encodings
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.encodings.iter())
    }

    /// Distinct labels with their entry counts, in first-appearance order.
    pub fn labels(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = Vec::new();
        for name in &self.names {
            match out.iter_mut().find(|(label, _)| *label == name.as_str()) {
                Some((_, count)) => *count += 1,
                None => out.push((name.as_str(), 1)),
            }
        }
        out
    }

    /// Write the gallery atomically (temp file + rename), creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| GalleryError::io(parent, e))?;
        }

        let mut bytes = GALLERY_MAGIC.to_vec();
        bincode::serialize_into(&mut bytes, self)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| GalleryError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| GalleryError::io(path, e))?;

        tracing::info!(path = %path.display(), entries = self.len(), "gallery saved");
        Ok(())
    }

    /// Load a gallery. A missing file is an error, never an empty gallery.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GalleryError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(GalleryError::io(path, e)),
        };

        let corrupt = |reason: String| GalleryError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let body = bytes
            .strip_prefix(&GALLERY_MAGIC[..])
            .ok_or_else(|| corrupt("missing KSPYGAL1 header".into()))?;
        let gallery: Gallery = bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))?;

        if gallery.names.len() != gallery.encodings.len() {
            return Err(corrupt(format!(
                "{} names for {} encodings",
                gallery.names.len(),
                gallery.encodings.len()
            )));
        }

        tracing::debug!(path = %path.display(), entries = gallery.len(), "gallery loaded");
        Ok(gallery)
    }
}

/// Counters reported after a gallery build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub labels: usize,
    pub images: usize,
    pub faces: usize,
    pub empty_images: usize,
}

/// Builds a [`Gallery`] from a `root/<label>/<image>` training tree.
pub struct GalleryBuilder<'a> {
    models: &'a dyn FaceModels,
    backend: DetectorBackend,
}

impl<'a> GalleryBuilder<'a> {
    pub fn new(models: &'a dyn FaceModels, backend: DetectorBackend) -> Self {
        Self { models, backend }
    }

    /// Detect and encode every image under `root`.
    ///
    /// Labels and files are visited in sorted order so the gallery (and with
    /// it the matcher's tie-break) is identical on every platform. Any
    /// unreadable image aborts the build.
    pub fn build(&self, root: &Path) -> Result<(Gallery, BuildStats), GalleryError> {
        let mut gallery = Gallery::default();
        let mut stats = BuildStats::default();

        for label_dir in sorted_entries(root).map_err(|e| GalleryError::io(root, e))? {
            if !label_dir.is_dir() {
                continue;
            }
            let Some(label) = label_dir.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %label_dir.display(), "skipping non-UTF-8 label directory");
                continue;
            };
            stats.labels += 1;

            for image_path in sorted_entries(&label_dir).map_err(|e| GalleryError::io(&label_dir, e))? {
                if !image_path.is_file() {
                    continue;
                }
                let faces = self.add_image(&mut gallery, label, &image_path)?;
                stats.images += 1;
                stats.faces += faces;
                if faces == 0 {
                    stats.empty_images += 1;
                }
            }
        }

        tracing::info!(
            labels = stats.labels,
            images = stats.images,
            faces = stats.faces,
            empty_images = stats.empty_images,
            backend = %self.backend,
            "gallery built"
        );
        Ok((gallery, stats))
    }

    fn add_image(&self, gallery: &mut Gallery, label: &str, path: &Path) -> Result<usize, GalleryError> {
        let image = image::open(path)
            .map_err(|source| GalleryError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();

        let faces = models::detect_and_encode(self.models, &image, self.backend).map_err(|source| {
            GalleryError::Model {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if faces.is_empty() {
            tracing::debug!(label, path = %path.display(), "no faces in training image");
        }

        let count = faces.len();
        for (_, encoding) in faces {
            gallery.push(label.to_string(), encoding);
        }
        tracing::debug!(label, path = %path.display(), faces = count, "encoded training image");
        Ok(count)
    }
}

/// Directory entries sorted by file name.
pub(crate) fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}
