//! Face extraction: one group photo in, indexed face crops out.

use crate::detector::{Detect, DetectorError};
use crate::types::{BoundingBox, FaceCrop};
use image::{ImageReader, RgbImage};
use std::path::Path;

/// Runs the detection capability over a decoded image and cuts out each face.
pub struct FaceExtractor<D> {
    detector: D,
}

impl<D: Detect> FaceExtractor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Detect once, then crop every box in detector order.
    ///
    /// Indices start at 1. Degenerate boxes still consume an index and yield
    /// an empty crop.
    pub fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceCrop>, DetectorError> {
        let boxes = self.detector.detect(image)?;
        Ok(boxes
            .into_iter()
            .zip(1u32..)
            .map(|(bbox, index)| crop_face(image, bbox, index))
            .collect())
    }
}

/// Decode an image from disk into RGB.
///
/// The format is sniffed from the file contents; the extension is only a
/// fallback.
pub fn decode_image(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8())
}

/// Cut `bbox` out of `image`, clamped to the image bounds.
pub fn crop_face(image: &RgbImage, bbox: BoundingBox, index: u32) -> FaceCrop {
    let (x, y, w, h) = bbox.clamp_to(image.width(), image.height());
    let cropped = if w == 0 || h == 0 {
        RgbImage::new(0, 0)
    } else {
        image::imageops::crop_imm(image, x, y, w, h).to_image()
    };
    FaceCrop {
        index,
        bbox,
        image: cropped,
    }
}
