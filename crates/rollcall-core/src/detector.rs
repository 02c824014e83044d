//! SCRFD face detector via ONNX Runtime.
//!
//! det_10g produces, for each of the strides 8, 16 and 32, a score map and a
//! distance-to-edge box map over a grid with two anchors per cell. Group
//! photos are letterboxed into the square RGB input and boxes are mapped back
//! to photo coordinates before overlap suppression.

use crate::types::{BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
pub const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Score, box and keypoint maps for each stride.
const EXPECTED_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detection capability: one image in, zero or more face boxes out.
///
/// Box order is whatever the implementation produces; callers index crops
/// in that order and never re-sort.
pub trait Detect {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Where a photo landed inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(src_width: u32, src_height: u32, size: u32) -> Self {
        let scale = (size as f32 / src_width as f32).min(size as f32 / src_height as f32);
        let width = ((src_width as f32 * scale).round() as u32).clamp(1, size);
        let height = ((src_height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: (size - width) / 2,
            pad_y: (size - height) / 2,
            width,
            height,
        }
    }

    /// Model-input coordinates to source-photo coordinates.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
    /// Indexed like `STRIDES`.
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < EXPECTED_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs {EXPECTED_OUTPUTS} outputs, found {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            outputs,
        })
    }

    /// Override the minimum face score (default 0.5).
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces in an RGB image, most confident first.
    pub fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, slots) in STRIDES.iter().zip(self.outputs) {
            let (_, scores) = outputs[slots.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, distances) = outputs[slots.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            candidates.extend(decode_stride(
                scores,
                distances,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let faces = suppress_overlaps(candidates, NMS_IOU_THRESHOLD);
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = faces.len(),
            "SCRFD detection complete"
        );
        Ok(faces)
    }
}

impl Detect for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self
            .detect_faces(image)?
            .iter()
            .map(Detection::to_pixel_box)
            .collect())
    }
}

/// Letterbox `image` into a normalized 1x3xNxN tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_SIZE);
    let resized = imageops::resize(image, letterbox.width, letterbox.height, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // The mean normalizes to zero, so the border needs no fill.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, ty, tx]] = (value as f32 - MEAN) / STD;
        }
    }
    (tensor, letterbox)
}

/// Locate each stride's score and box maps.
///
/// Exports that name their outputs `score_8`, `bbox_16`, ... are matched by
/// name; anything else is assumed to use the insightface order of scores,
/// then boxes, then keypoints.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |name: &str| names.iter().position(|n| n == name);
    let named = STRIDES.map(|stride| {
        Some(StrideOutputs {
            score: position(&format!("score_{stride}"))?,
            bbox: position(&format!("bbox_{stride}"))?,
        })
    });
    if let [Some(s8), Some(s16), Some(s32)] = named {
        return [s8, s16, s32];
    }
    tracing::debug!(?names, "SCRFD output names not recognized; using positional layout");
    [0, 1, 2].map(|i| StrideOutputs {
        score: i,
        bbox: i + STRIDES.len(),
    })
}

/// Turn one stride's maps into photo-space detections above `threshold`.
fn decode_stride(
    scores: &[f32],
    distances: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let cols = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let d = distances.get(anchor * 4..anchor * 4 + 4)?;
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;

            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);
            Some(Detection {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by confidence.
fn suppress_overlaps(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
