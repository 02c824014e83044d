use anyhow::{Context, Result};
use rollcall_core::{DistanceMetric, ReportFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Run configuration.
///
/// Resolved in layers: built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory of group photos, one per classroom.
    pub input_dir: PathBuf,
    /// Directory of reference faces, one per identity.
    pub gallery_dir: PathBuf,
    /// Working store for extracted faces. Wiped on every extraction.
    pub work_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub metric: DistanceMetric,
    /// Match threshold; `None` uses the metric's ArcFace default.
    pub threshold: Option<f32>,
    /// Minimum SCRFD score for a face.
    pub detection_confidence: f32,
    /// Save zero-area crops as placeholder files.
    pub keep_degenerate_crops: bool,
    /// Image format of saved crops, by extension.
    pub crop_extension: String,
    pub format: ReportFormat,
}

/// On-disk form: every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub input_dir: Option<PathBuf>,
    pub gallery_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub metric: Option<DistanceMetric>,
    pub threshold: Option<f32>,
    pub detection_confidence: Option<f32>,
    pub keep_degenerate_crops: Option<bool>,
    pub crop_extension: Option<String>,
    pub format: Option<ReportFormat>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("present"),
            gallery_dir: PathBuf::from("database"),
            work_dir: PathBuf::from("people"),
            model_dir: rollcall_core::default_model_dir(),
            metric: DistanceMetric::default(),
            threshold: None,
            detection_confidence: rollcall_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            keep_degenerate_crops: true,
            crop_extension: rollcall_core::repository::DEFAULT_CROP_EXTENSION.to_string(),
            format: ReportFormat::default(),
        }
    }
}

impl Config {
    /// Defaults, then `file` if given, then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = file {
            config.apply_file(read_file(path)?);
            tracing::debug!(path = %path.display(), "config file applied");
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            input_dir,
            gallery_dir,
            work_dir,
            model_dir,
            metric,
            threshold,
            detection_confidence,
            keep_degenerate_crops,
            crop_extension,
            format,
        } = file;

        if let Some(v) = input_dir {
            self.input_dir = v;
        }
        if let Some(v) = gallery_dir {
            self.gallery_dir = v;
        }
        if let Some(v) = work_dir {
            self.work_dir = v;
        }
        if let Some(v) = model_dir {
            self.model_dir = v;
        }
        if let Some(v) = metric {
            self.metric = v;
        }
        if threshold.is_some() {
            self.threshold = threshold;
        }
        if let Some(v) = detection_confidence {
            self.detection_confidence = v;
        }
        if let Some(v) = keep_degenerate_crops {
            self.keep_degenerate_crops = v;
        }
        if let Some(v) = crop_extension {
            self.crop_extension = v;
        }
        if let Some(v) = format {
            self.format = v;
        }
    }

    /// Apply `ROLLCALL_*` variables read through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_INPUT_DIR") {
            self.input_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_METRIC") {
            self.metric = v;
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_THRESHOLD") {
            self.threshold = Some(v);
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_DETECTION_CONFIDENCE") {
            self.detection_confidence = v;
        }
        if let Some(v) = lookup("ROLLCALL_KEEP_DEGENERATE_CROPS") {
            self.keep_degenerate_crops = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = lookup("ROLLCALL_CROP_EXTENSION") {
            self.crop_extension = v;
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_FORMAT") {
            self.format = v;
        }
    }

    /// Effective match threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
            .unwrap_or_else(|| self.metric.default_threshold())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::RECOGNIZER_MODEL_FILE)
    }
}

/// Read and parse a TOML config file.
pub fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}
