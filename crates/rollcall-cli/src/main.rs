use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{
    extract_classrooms, take_attendance, ArcFaceVerifier, AttendanceMatcher, AttendanceReport,
    ClassroomFaces, Diagnostics, DistanceMetric, ExtractOptions, FaceDetector, FaceExtractor,
    FaceRecognizer, FsClassroomRepository, IdentityGallery, ReportEmitter, ReportFormat,
    RunSummary,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "rollcall",
    version,
    about = "Take classroom attendance from group photos"
)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory of group photos, one per classroom
    #[arg(short, long, global = true)]
    input: Option<PathBuf>,
    /// Directory of reference faces, one per identity
    #[arg(short, long, global = true)]
    gallery: Option<PathBuf>,
    /// Working store for extracted faces (wiped by extract)
    #[arg(short, long, global = true)]
    work_dir: Option<PathBuf>,
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Distance metric: cosine or euclidean_l2
    #[arg(long, global = true)]
    metric: Option<DistanceMetric>,
    /// Match threshold (defaults to the metric's ArcFace threshold)
    #[arg(long, global = true)]
    threshold: Option<f32>,
    /// Report format: text or json
    #[arg(long, global = true)]
    format: Option<ReportFormat>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Extract faces, then take attendance (default)
    Run,
    /// Rebuild the working store from the group photos
    Extract,
    /// Take attendance from an existing working store
    Attend,
    /// List gallery identities
    Gallery,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = &self.input {
            config.input_dir = v.clone();
        }
        if let Some(v) = &self.gallery {
            config.gallery_dir = v.clone();
        }
        if let Some(v) = &self.work_dir {
            config.work_dir = v.clone();
        }
        if let Some(v) = &self.model_dir {
            config.model_dir = v.clone();
        }
        if let Some(v) = self.metric {
            config.metric = v;
        }
        if self.threshold.is_some() {
            config.threshold = self.threshold;
        }
        if let Some(v) = self.format {
            config.format = v;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.overrides.config.as_deref())?;
    cli.overrides.apply(&mut config);
    tracing::debug!(?config, "configuration resolved");

    let mut diagnostics = Diagnostics::default();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            extract(&config, &mut diagnostics)?;
            let reports = attend(&config, &mut diagnostics)?;
            tracing::info!("{}", RunSummary::new(reports, diagnostics));
        }
        Commands::Extract => {
            let classrooms = extract(&config, &mut diagnostics)?;
            for faces in &classrooms {
                println!("{}: {} faces", faces.classroom, faces.saved);
            }
            tracing::info!("{} classrooms, {} diagnostics", classrooms.len(), diagnostics.len());
        }
        Commands::Attend => {
            let reports = attend(&config, &mut diagnostics)?;
            tracing::info!("{}", RunSummary::new(reports, diagnostics));
        }
        Commands::Gallery => {
            let gallery = IdentityGallery::load(&config.gallery_dir).with_context(|| {
                format!("loading gallery from {}", config.gallery_dir.display())
            })?;
            if gallery.is_empty() {
                println!("No identities in {}", config.gallery_dir.display());
            }
            for identity in &gallery {
                println!("{}\t{}", identity.name, identity.reference.display());
            }
        }
    }

    Ok(())
}

fn repository(config: &Config) -> FsClassroomRepository {
    FsClassroomRepository::new(&config.work_dir).with_extension(&config.crop_extension)
}

fn extract(config: &Config, diagnostics: &mut Diagnostics) -> Result<Vec<ClassroomFaces>> {
    let model = config.detector_model_path();
    let detector = FaceDetector::load(&model)
        .with_context(|| format!("loading detector from {}", model.display()))?
        .with_confidence_threshold(config.detection_confidence);
    let mut extractor = FaceExtractor::new(detector);
    let mut repo = repository(config);

    let options = ExtractOptions {
        keep_degenerate_crops: config.keep_degenerate_crops,
    };
    extract_classrooms(
        &mut extractor,
        &mut repo,
        &config.input_dir,
        options,
        diagnostics,
    )
    .with_context(|| format!("extracting faces from {}", config.input_dir.display()))
}

/// Reports are written to stdout as each classroom completes.
fn attend(config: &Config, diagnostics: &mut Diagnostics) -> Result<Vec<AttendanceReport>> {
    let model = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&model)
        .with_context(|| format!("loading recognizer from {}", model.display()))?;
    let verifier = ArcFaceVerifier::new(recognizer, config.metric, config.threshold());
    let mut matcher = AttendanceMatcher::new(verifier);
    let repo = repository(config);

    let stdout = std::io::stdout();
    let mut emitter = ReportEmitter::new(stdout.lock(), config.format);
    take_attendance(
        &mut matcher,
        &repo,
        &config.gallery_dir,
        &mut emitter,
        diagnostics,
    )
    .with_context(|| format!("taking attendance from {}", config.work_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["rollcall"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.overrides.input.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "attend",
            "--gallery",
            "known",
            "--metric",
            "euclidean_l2",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Commands::Attend));
        assert_eq!(cli.overrides.gallery, Some(PathBuf::from("known")));
        assert_eq!(cli.overrides.metric, Some(DistanceMetric::EuclideanL2));
        assert_eq!(cli.overrides.format, Some(ReportFormat::Json));
    }

    #[test]
    fn test_rejects_unknown_metric() {
        assert!(Cli::try_parse_from(["rollcall", "--metric", "manhattan"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        config.threshold = Some(0.5);
        let overrides = Overrides {
            input: Some(PathBuf::from("photos")),
            threshold: Some(0.3),
            ..Overrides::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.input_dir, PathBuf::from("photos"));
        assert_eq!(config.gallery_dir, PathBuf::from("database"));
        assert_eq!(config.threshold, Some(0.3));
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut config = Config::default();
        config.metric = DistanceMetric::EuclideanL2;
        Overrides::default().apply(&mut config);
        assert_eq!(config.metric, DistanceMetric::EuclideanL2);
    }
}
