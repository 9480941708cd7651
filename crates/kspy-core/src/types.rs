use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel bounding box for a detected face, `(top, right, bottom, left)` with
/// a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceBox {
    pub const fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// A detection is valid when its edges are not inverted.
    pub fn is_valid(&self) -> bool {
        self.top <= self.bottom && self.left <= self.right
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Clamp the box to an image of the given size.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as i32;
        let max_y = height.saturating_sub(1) as i32;
        Self {
            top: self.top.clamp(0, max_y),
            right: self.right.clamp(0, max_x),
            bottom: self.bottom.clamp(0, max_y),
            left: self.left.clamp(0, max_x),
        }
    }
}

/// A displayed box on a live frame.
///
/// Coordinates are kept in floating point between ticks so that easing
/// toward a goal never stalls on integer truncation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl TrackedBox {
    /// Round to the nearest pixel box for rendering.
    pub fn to_face_box(&self) -> FaceBox {
        FaceBox {
            top: self.top.round() as i32,
            right: self.right.round() as i32,
            bottom: self.bottom.round() as i32,
            left: self.left.round() as i32,
        }
    }

    /// Largest per-coordinate distance to `goal`.
    pub fn distance_to(&self, goal: &FaceBox) -> f32 {
        [
            (goal.top as f32 - self.top).abs(),
            (goal.right as f32 - self.right).abs(),
            (goal.bottom as f32 - self.bottom).abs(),
            (goal.left as f32 - self.left).abs(),
        ]
        .into_iter()
        .fold(0.0, f32::max)
    }
}

impl From<FaceBox> for TrackedBox {
    fn from(b: FaceBox) -> Self {
        Self {
            top: b.top as f32,
            right: b.right as f32,
            bottom: b.bottom as f32,
            left: b.left as f32,
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Embeddings from different model versions live in different spaces.
    /// Unversioned embeddings are assumed to share the caller's model.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b && self.values.len() == other.values.len(),
            _ => self.values.len() == other.values.len(),
        }
    }
}

/// Outcome of identifying one face.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Detector backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    /// Small, CPU-friendly detector.
    #[default]
    Fast,
    /// Larger, slower and more accurate detector.
    Accurate,
}

impl DetectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorBackend::Fast => "fast",
            DetectorBackend::Accurate => "accurate",
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    /// Accepts `fast`/`hog` and `accurate`/`cnn`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectorBackend::Fast),
            "accurate" | "cnn" => Ok(DetectorBackend::Accurate),
            other => Err(format!(
                "unknown detector backend '{other}' (expected fast|hog|accurate|cnn)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_box_validity() {
        assert!(FaceBox::new(10, 50, 50, 10).is_valid());
        assert!(FaceBox::new(10, 10, 10, 10).is_valid());
        assert!(!FaceBox::new(50, 50, 10, 10).is_valid());
        assert!(!FaceBox::new(10, 10, 50, 50).is_valid());
    }

    #[test]
    fn test_face_box_clamp() {
        let b = FaceBox::new(-5, 700, 500, -1).clamp_to(640, 480);
        assert_eq!(b, FaceBox::new(0, 639, 479, 0));
    }

    #[test]
    fn test_tracked_box_snap_and_round() {
        let goal = FaceBox::new(10, 50, 50, 10);
        let tracked = TrackedBox::from(goal);
        assert_eq!(tracked.to_face_box(), goal);
        assert_eq!(tracked.distance_to(&goal), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_embedding_comparability() {
        let mut a = Embedding::new(vec![1.0, 0.0]);
        let mut b = Embedding::new(vec![1.0, 0.0]);
        assert!(a.is_comparable(&b));

        a.model_version = Some("w600k_r50".into());
        assert!(a.is_comparable(&b));

        b.model_version = Some("other".into());
        assert!(!a.is_comparable(&b));

        let c = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!(!c.is_comparable(&Embedding::new(vec![1.0])));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Known("alice".into()).to_string(), "alice");
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
        assert_eq!(Identity::Unknown.label(), None);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("hog".parse::<DetectorBackend>(), Ok(DetectorBackend::Fast));
        assert_eq!("CNN".parse::<DetectorBackend>(), Ok(DetectorBackend::Accurate));
        assert_eq!("fast".parse::<DetectorBackend>(), Ok(DetectorBackend::Fast));
        assert!("gpu".parse::<DetectorBackend>().is_err());
    }
}
