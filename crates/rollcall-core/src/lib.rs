//! rollcall-core: classroom attendance from group photographs.
//!
//! Faces are cut out of each group photo into a per-classroom working store,
//! then matched against a gallery of known identities. Detection (SCRFD) and
//! verification (ArcFace) run via ONNX Runtime behind the [`Detect`] and
//! [`Verify`] traits.

pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod report;
pub mod repository;
pub mod types;

use std::path::PathBuf;

pub use detector::{Detect, FaceDetector};
pub use extractor::FaceExtractor;
pub use gallery::{Identity, IdentityGallery};
pub use matcher::AttendanceMatcher;
pub use pipeline::{extract_classrooms, take_attendance, ClassroomFaces, ExtractOptions, RunSummary};
pub use recognizer::{ArcFaceVerifier, FaceRecognizer, Verify};
pub use report::{ReportEmitter, ReportFormat};
pub use repository::{ClassroomRepository, FsClassroomRepository, MemoryClassroomRepository};
pub use types::{
    AttendanceReport, AttendanceStatus, BoundingBox, Diagnostic, Diagnostics, DistanceMetric,
    FaceCrop,
};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}
