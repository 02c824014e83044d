use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Integer face box in source-image pixel coordinates, corner form.
///
/// Invariant: `x2 >= x1` and `y2 >= y1`. A box with zero width or height is
/// degenerate and crops to an empty image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Build a box from two corners, swapping coordinates so the invariant holds.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.abs_diff(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.abs_diff(self.y1)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersect with a `width` × `height` image.
    ///
    /// Returns `(x, y, w, h)` of the visible region, with `w` or `h` zero when
    /// the box is degenerate or lies outside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp_x = |v: i32| v.clamp(0, width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, height as i32) as u32;
        let (x1, x2) = (clamp_x(self.x1), clamp_x(self.x2));
        let (y1, y2) = (clamp_y(self.y1), clamp_y(self.y2));
        (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }
}

/// Raw detector output for one face, before conversion to pixel corners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Detection {
    /// Intersection over union of the two boxes; 0 when both are empty.
    pub fn iou(&self, other: &Detection) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h =
            ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Round to the enclosing integer pixel box.
    pub fn to_pixel_box(&self) -> BoundingBox {
        BoundingBox::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            (self.x + self.width).ceil() as i32,
            (self.y + self.height).ceil() as i32,
        )
    }
}

/// One face cut out of a group photo.
///
/// `index` is 1-based and follows detector order within the source image.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub index: u32,
    pub bbox: BoundingBox,
    pub image: RgbImage,
}

impl FaceCrop {
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy scaled to unit length. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// How two embeddings are compared when deciding a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, matched when at or below the threshold.
    #[default]
    Cosine,
    /// Euclidean distance between L2-normalized embeddings.
    EuclideanL2,
}

impl DistanceMetric {
    /// ArcFace decision threshold for this metric.
    pub fn default_threshold(self) -> f32 {
        match self {
            DistanceMetric::Cosine => 0.68,
            DistanceMetric::EuclideanL2 => 1.13,
        }
    }

    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
            DistanceMetric::EuclideanL2 => a.normalized().euclidean_distance(&b.normalized()),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean_l2" | "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown metric {other:?} (expected cosine or euclidean_l2)")),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => f.write_str("cosine"),
            DistanceMetric::EuclideanL2 => f.write_str("euclidean_l2"),
        }
    }
}

/// Outcome of one successful verification call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub matched: bool,
    /// Distance the decision was based on. Logged, never reported.
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::Present => f.write_str("Present"),
            AttendanceStatus::Absent => f.write_str("Absent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub status: AttendanceStatus,
}

/// Attendance table for one classroom, rows in gallery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceReport {
    pub classroom: String,
    #[serde(rename = "attendance")]
    pub records: Vec<AttendanceRecord>,
}

impl AttendanceReport {
    /// Every identity starts out Absent.
    pub fn all_absent<'a>(classroom: &str, identities: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            classroom: classroom.to_string(),
            records: identities
                .into_iter()
                .map(|name| AttendanceRecord {
                    identity: name.to_string(),
                    status: AttendanceStatus::Absent,
                })
                .collect(),
        }
    }

    /// Flip the record at `pos` to Present.
    ///
    /// Returns `false` if it was already Present; status never moves back.
    pub fn mark_present(&mut self, pos: usize) -> bool {
        match self.records.get_mut(pos) {
            Some(rec) if rec.status == AttendanceStatus::Absent => {
                rec.status = AttendanceStatus::Present;
                true
            }
            _ => false,
        }
    }

    pub fn status_of(&self, identity: &str) -> Option<AttendanceStatus> {
        self.records
            .iter()
            .find(|r| r.identity == identity)
            .map(|r| r.status)
    }

    pub fn present_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Present)
            .count()
    }

    pub fn all_present(&self) -> bool {
        self.present_count() == self.records.len()
    }
}

/// A recoverable problem. Logged where it happens and collected for the caller;
/// never aborts the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Diagnostic {
    #[error("skipping {}: unable to read image: {reason}", path.display())]
    SourceImageUnreadable { path: PathBuf, reason: String },
    #[error("face detection failed for {}: {reason}", path.display())]
    DetectionFailed { path: PathBuf, reason: String },
    #[error("could not save face {index} of {classroom}: {reason}")]
    FaceNotSaved {
        classroom: String,
        index: u32,
        reason: String,
    },
    #[error("could not create classroom {classroom:?} for {}: {reason}", path.display())]
    ClassroomNotCreated {
        classroom: String,
        path: PathBuf,
        reason: String,
    },
    #[error("{classroom} folder not found")]
    ClassroomMissing { classroom: String },
    #[error("could not list faces of {classroom}: {reason}")]
    ClassroomUnreadable { classroom: String, reason: String },
    #[error("error processing {} with {}: {reason}", face.display(), reference.display())]
    VerificationFailed {
        face: PathBuf,
        reference: PathBuf,
        reason: String,
    },
}

/// Collects diagnostics for the caller, logging each one as it arrives.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn record(&mut self, diagnostic: Diagnostic) {
        tracing::warn!("{diagnostic}");
        self.items.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
