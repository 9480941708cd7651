//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD anchor-free detector on letterboxed RGB frames and decodes
//! the three stride levels into pixel [`FaceBox`]es, followed by NMS.

use crate::models::ModelError;
use crate::types::{DetectorBackend, FaceBox};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Square input edge used by the small (fast) detector.
pub const FAST_INPUT_SIZE: usize = 320;
/// Square input edge used by the large (accurate) detector.
pub const ACCURATE_INPUT_SIZE: usize = 640;

/// Input edge for a backend.
pub fn input_size_for(backend: DetectorBackend) -> usize {
    match backend {
        DetectorBackend::Fast => FAST_INPUT_SIZE,
        DetectorBackend::Accurate => ACCURATE_INPUT_SIZE,
    }
}

/// Letterbox parameters needed to map detections back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Raw decoded candidate in source-frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model that expects a square `input_size` input.
    pub fn load(model_path: &Path, input_size: usize) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_output_indices(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size,
            stride_outputs,
        })
    }

    /// Detect faces in an RGB frame.
    ///
    /// Boxes are clamped to the frame and ordered left to right, then top to
    /// bottom, so a static scene yields a stable positional order.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, ModelError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(frame, self.input_size);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                ModelError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                ModelError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);
        Ok(to_face_boxes(&kept, frame.width(), frame.height()))
    }
}

/// Letterbox an RGB frame into a normalized NCHW tensor.
fn preprocess(frame: &RgbImage, input_size: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let scale = (input_size as f32 / width).min(input_size as f32 / height);
    let new_w = ((width * scale).round() as u32).clamp(1, input_size as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, input_size as u32);
    let pad_x = (input_size as u32 - new_w) / 2;
    let pad_y = (input_size as u32 - new_h) / 2;

    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    // Padding pixels normalize to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Map SCRFD outputs to stride slots.
///
/// Exports either name tensors `score_8`, `bbox_16`, ... or use generic
/// numeric names, in which case the standard positional layout applies:
/// scores for strides 8/16/32 first, then bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let unletterbox_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
            let unletterbox_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

            Some(Candidate {
                x1: unletterbox_x(cx - offsets[0] * s),
                y1: unletterbox_y(cy - offsets[1] * s),
                x2: unletterbox_x(cx + offsets[2] * s),
                y2: unletterbox_y(cy + offsets[3] * s),
                score,
            })
        })
        .collect()
}

fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

fn to_face_boxes(candidates: &[Candidate], width: u32, height: u32) -> Vec<FaceBox> {
    let mut boxes: Vec<FaceBox> = candidates
        .iter()
        .map(|c| {
            FaceBox::new(
                c.y1.round() as i32,
                c.x2.round() as i32,
                c.y2.round() as i32,
                c.x1.round() as i32,
            )
            .clamp_to(width, height)
        })
        .filter(|b| b.is_valid() && b.width() > 0 && b.height() > 0)
        .collect();
    boxes.sort_by_key(|b| (b.left, b.top));
    boxes
}
