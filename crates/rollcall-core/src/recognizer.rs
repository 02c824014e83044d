//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from face crops using the
//! w600k_r50 ArcFace model, and decides whether two face images show the
//! same person.

use crate::extractor::decode_image;
use crate::types::{DistanceMetric, Embedding, Verification};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

// w600k_r50 input geometry. ArcFace normalizes symmetrically, unlike SCRFD.
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("cannot read face image {}: {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("face image {} is empty", .0.display())]
    EmptyImage(PathBuf),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face verification capability: do these two face images show the same person?
pub trait Verify {
    fn verify(&mut self, face: &Path, reference: &Path) -> Result<Verification, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding from a face crop of any size.
    ///
    /// The crop is resized to 112x112; no landmark alignment is applied.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let size = ARCFACE_INPUT_SIZE as u32;
        let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
        let input = Self::preprocess(&resized);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        let embedding = Embedding {
            values: raw_data.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        };
        Ok(embedding.normalized())
    }

    /// Preprocess a 112x112 RGB face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned_face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

/// Verifies a face pair by comparing ArcFace embeddings under a distance metric.
pub struct ArcFaceVerifier {
    recognizer: FaceRecognizer,
    metric: DistanceMetric,
    threshold: f32,
}

impl ArcFaceVerifier {
    pub fn new(recognizer: FaceRecognizer, metric: DistanceMetric, threshold: f32) -> Self {
        Self {
            recognizer,
            metric,
            threshold,
        }
    }

    fn embed_file(&mut self, path: &Path) -> Result<Embedding, RecognizerError> {
        let image = load_face(path)?;
        self.recognizer.embed(&image)
    }
}

impl Verify for ArcFaceVerifier {
    fn verify(&mut self, face: &Path, reference: &Path) -> Result<Verification, RecognizerError> {
        let probe = self.embed_file(face)?;
        let known = self.embed_file(reference)?;
        Ok(decide(self.metric, self.threshold, &probe, &known))
    }
}

/// Decode a face image from disk, rejecting empty images.
fn load_face(path: &Path) -> Result<RgbImage, RecognizerError> {
    let image = decode_image(path).map_err(|source| RecognizerError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(RecognizerError::EmptyImage(path.to_path_buf()));
    }
    Ok(image)
}

fn decide(metric: DistanceMetric, threshold: f32, a: &Embedding, b: &Embedding) -> Verification {
    let distance = metric.distance(a, b);
    Verification {
        matched: distance <= threshold,
        distance,
    }
}
