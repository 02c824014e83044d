//! The two phases of an attendance run.
//!
//! 1. [`extract_classrooms`] wipes the working store and fills one bucket per
//!    group photo with face crops.
//! 2. [`take_attendance`] walks the buckets in name order, matches each one
//!    against a freshly loaded gallery and emits its report.
//!
//! Only environment failures (store or input directory unusable) return
//! `Err`. Per-image, per-classroom, per-face and per-comparison problems
//! become [`Diagnostic`]s and the run continues.

use crate::detector::Detect;
use crate::extractor::{decode_image, FaceExtractor};
use crate::gallery::{GalleryError, IdentityGallery};
use crate::matcher::AttendanceMatcher;
use crate::recognizer::Verify;
use crate::report::ReportEmitter;
use crate::repository::{ClassroomRepository, RepositoryError};
use crate::types::{AttendanceReport, Diagnostic, Diagnostics};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot read input directory {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("cannot write report: {0}")]
    Emit(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Persist zero-area crops as placeholders so face numbering has no gaps.
    pub keep_degenerate_crops: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            keep_degenerate_crops: true,
        }
    }
}

/// What extraction produced for one source photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassroomFaces {
    pub classroom: String,
    pub source: PathBuf,
    pub detected: usize,
    pub saved: usize,
}

/// Everything a run produced: reports in classroom order plus every
/// diagnostic recorded along the way.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<AttendanceReport>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunSummary {
    pub fn new(reports: Vec<AttendanceReport>, diagnostics: Diagnostics) -> Self {
        Self {
            reports,
            diagnostics: diagnostics.into_vec(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} classrooms, {} diagnostics",
            self.reports.len(),
            self.diagnostics.len()
        )
    }
}

/// Regular files in `dir`, sorted by name.
pub fn list_source_images(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let io_err = |source| PipelineError::Input {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Rebuild the working store from every photo in `input_dir`.
///
/// Each photo gets a bucket named after its file stem, even when it cannot be
/// decoded or contains no faces.
pub fn extract_classrooms<D: Detect, R: ClassroomRepository + ?Sized>(
    extractor: &mut FaceExtractor<D>,
    repo: &mut R,
    input_dir: &Path,
    options: ExtractOptions,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<ClassroomFaces>, PipelineError> {
    let sources = list_source_images(input_dir)?;
    repo.rebuild()?;

    let mut summary = Vec::with_capacity(sources.len());
    for source in sources {
        let Some(name) = source.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            tracing::warn!(path = %source.display(), "skipping photo with unusable name");
            continue;
        };
        let classroom = match repo.create_classroom(&name) {
            Ok(classroom) => classroom,
            Err(e) => {
                diagnostics.record(Diagnostic::ClassroomNotCreated {
                    classroom: name,
                    path: source,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let mut faces = ClassroomFaces {
            classroom: name.clone(),
            source: source.clone(),
            detected: 0,
            saved: 0,
        };

        let image = match decode_image(&source) {
            Ok(image) => image,
            Err(e) => {
                diagnostics.record(Diagnostic::SourceImageUnreadable {
                    path: source.clone(),
                    reason: e.to_string(),
                });
                summary.push(faces);
                continue;
            }
        };

        let crops = match extractor.extract(&image) {
            Ok(crops) => crops,
            Err(e) => {
                diagnostics.record(Diagnostic::DetectionFailed {
                    path: source.clone(),
                    reason: e.to_string(),
                });
                summary.push(faces);
                continue;
            }
        };
        faces.detected = crops.len();

        for crop in &crops {
            if crop.is_empty() && !options.keep_degenerate_crops {
                tracing::debug!(classroom = %name, index = crop.index, bbox = ?crop.bbox, "dropping empty crop");
                continue;
            }
            match repo.save_face(&classroom, crop) {
                Ok(_) => faces.saved += 1,
                Err(e) => diagnostics.record(Diagnostic::FaceNotSaved {
                    classroom: name.clone(),
                    index: crop.index,
                    reason: e.to_string(),
                }),
            }
        }

        tracing::info!(
            classroom = %name,
            detected = faces.detected,
            saved = faces.saved,
            "all faces saved"
        );
        summary.push(faces);
    }

    Ok(summary)
}

/// Match every classroom in the store, in name order, emitting each report
/// as soon as it is complete.
///
/// The gallery is reloaded for every classroom.
pub fn take_attendance<V: Verify, R: ClassroomRepository + ?Sized, W: Write>(
    matcher: &mut AttendanceMatcher<V>,
    repo: &R,
    gallery_dir: &Path,
    emitter: &mut ReportEmitter<W>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<AttendanceReport>, PipelineError> {
    let mut reports = Vec::new();
    for name in repo.list_classrooms()? {
        let gallery = IdentityGallery::load(gallery_dir)?;
        if let Some(report) = matcher.match_classroom(repo, &name, &gallery, diagnostics) {
            tracing::info!(
                classroom = %name,
                present = report.present_count(),
                total = report.records.len(),
                "attendance taken"
            );
            emitter.emit(&report).map_err(PipelineError::Emit)?;
            reports.push(report);
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::recognizer::RecognizerError;
    use crate::report::ReportFormat;
    use crate::repository::{ClassroomHandle, FsClassroomRepository, MemoryClassroomRepository};
    use crate::types::FaceCrop;
    use crate::types::{AttendanceStatus, BoundingBox, Verification};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    const RED: Rgb<u8> = Rgb([220, 20, 20]);
    const BLUE: Rgb<u8> = Rgb([20, 20, 220]);
    const GREEN: Rgb<u8> = Rgb([20, 220, 20]);

    /// Reports the same two 10x10 boxes for every image, except images
    /// 13 pixels wide, which make it fail.
    struct TwoSeats {
        boxes: Vec<BoundingBox>,
    }

    impl TwoSeats {
        fn new() -> Self {
            Self {
                boxes: vec![BoundingBox::new(0, 0, 10, 10), BoundingBox::new(20, 0, 30, 10)],
            }
        }
    }

    impl Detect for TwoSeats {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.width() == 13 {
                return Err(DetectorError::InferenceFailed("scripted".into()));
            }
            Ok(self.boxes.clone())
        }
    }

    /// Two images show the same person when their top-left pixels are equal.
    struct SameColor;

    impl Verify for SameColor {
        fn verify(&mut self, face: &Path, reference: &Path) -> Result<Verification, RecognizerError> {
            let load = |p: &Path| {
                image::open(p)
                    .map(|i| *i.to_rgb8().get_pixel(0, 0))
                    .map_err(|source| RecognizerError::ImageLoad {
                        path: p.to_path_buf(),
                        source,
                    })
            };
            let matched = load(face)? == load(reference)?;
            Ok(Verification {
                matched,
                distance: if matched { 0.0 } else { 1.0 },
            })
        }
    }

    struct Fixture {
        tmp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            for dir in ["present", "database"] {
                std::fs::create_dir(tmp.path().join(dir)).unwrap();
            }
            Self { tmp }
        }

        fn input(&self) -> PathBuf {
            self.tmp.path().join("present")
        }

        fn gallery(&self) -> PathBuf {
            self.tmp.path().join("database")
        }

        fn work(&self) -> PathBuf {
            self.tmp.path().join("people")
        }

        /// 40x20 photo: left seat in `left`, right seat in `right`.
        fn photo(&self, name: &str, left: Rgb<u8>, right: Rgb<u8>) {
            let img = RgbImage::from_fn(40, 20, |x, _| if x < 20 { left } else { right });
            img.save(self.input().join(name)).unwrap();
        }

        fn reference(&self, name: &str, color: Rgb<u8>) {
            RgbImage::from_pixel(8, 8, color)
                .save(self.gallery().join(name))
                .unwrap();
        }

        fn repo(&self) -> FsClassroomRepository {
            FsClassroomRepository::new(self.work()).with_extension("png")
        }
    }

    fn run(fx: &Fixture, options: ExtractOptions) -> (Vec<AttendanceReport>, Diagnostics, String) {
        let mut diags = Diagnostics::default();
        let mut repo = fx.repo();
        let mut extractor = FaceExtractor::new(TwoSeats::new());
        extract_classrooms(&mut extractor, &mut repo, &fx.input(), options, &mut diags).unwrap();

        let mut matcher = AttendanceMatcher::new(SameColor);
        let mut emitter = ReportEmitter::new(Vec::new(), ReportFormat::Text);
        let reports = take_attendance(&mut matcher, &repo, &fx.gallery(), &mut emitter, &mut diags).unwrap();
        let out = String::from_utf8(emitter.into_inner()).unwrap();
        (reports, diags, out)
    }

    #[test]
    fn test_end_to_end_reports_in_classroom_order() {
        let fx = Fixture::new();
        fx.photo("room2.png", GREEN, GREEN);
        fx.photo("room1.png", RED, BLUE);
        fx.reference("alice.png", RED);
        fx.reference("bob.png", BLUE);
        fx.reference("carol.png", GREEN);

        let (reports, diags, out) = run(&fx, ExtractOptions::default());

        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(
            out,
            "Attendance for room1\nalice -> Present\nbob -> Present\ncarol -> Absent\n\n\
             Attendance for room2\nalice -> Absent\nbob -> Absent\ncarol -> Present\n"
        );
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn test_every_report_lists_the_whole_gallery() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, RED);
        fx.photo("room2.png", BLUE, GREEN);
        fx.reference("bob.png", BLUE);
        fx.reference("alice.png", RED);

        let (reports, _, _) = run(&fx, ExtractOptions::default());

        for report in &reports {
            let names: Vec<&str> = report.records.iter().map(|r| r.identity.as_str()).collect();
            assert_eq!(names, vec!["alice", "bob"]);
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        fx.photo("room2.png", GREEN, GREEN);

        let mut extractor = FaceExtractor::new(TwoSeats::new());
        let mut repo = fx.repo();
        let mut diags = Diagnostics::default();

        let first = extract_classrooms(&mut extractor, &mut repo, &fx.input(), ExtractOptions::default(), &mut diags).unwrap();
        let second = extract_classrooms(&mut extractor, &mut repo, &fx.input(), ExtractOptions::default(), &mut diags).unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.list_classrooms().unwrap(), vec!["room1", "room2"]);
        let room1 = repo.open_classroom("room1").unwrap().unwrap();
        assert_eq!(repo.list_faces(&room1).unwrap().len(), 2);
    }

    #[test]
    fn test_stale_classrooms_are_wiped() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        std::fs::create_dir_all(fx.work().join("old_room")).unwrap();
        std::fs::write(fx.work().join("old_room/face_1.png"), b"stale").unwrap();

        let (reports, _, _) = run(&fx, ExtractOptions::default());

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].classroom, "room1");
        assert!(!fx.work().join("old_room").exists());
    }

    #[test]
    fn test_unreadable_photo_gets_empty_bucket() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        std::fs::write(fx.input().join("broken.jpg"), b"definitely not a jpeg").unwrap();
        fx.reference("alice.png", RED);

        let (reports, diags, _) = run(&fx, ExtractOptions::default());

        assert_eq!(reports[0].classroom, "broken");
        assert_eq!(reports[0].status_of("alice"), Some(AttendanceStatus::Absent));
        assert_eq!(reports[1].status_of("alice"), Some(AttendanceStatus::Present));
        assert_eq!(diags.len(), 1);
        assert!(matches!(
            diags.iter().next(),
            Some(Diagnostic::SourceImageUnreadable { .. })
        ));
    }

    #[test]
    fn test_unusable_classroom_name_is_isolated() {
        let fx = Fixture::new();
        fx.photo("a\\b.png", RED, RED);
        fx.photo("..png", BLUE, BLUE);
        fx.photo("room1.png", RED, BLUE);
        fx.reference("alice.png", RED);

        let (reports, diags, _) = run(&fx, ExtractOptions::default());

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].classroom, "room1");
        assert_eq!(reports[0].status_of("alice"), Some(AttendanceStatus::Present));
        let names: Vec<&str> = diags
            .iter()
            .filter_map(|d| match d {
                Diagnostic::ClassroomNotCreated { classroom, .. } => Some(classroom.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec![".", "a\\b"]);
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn test_detection_failure_is_isolated() {
        let fx = Fixture::new();
        RgbImage::from_pixel(13, 13, RED)
            .save(fx.input().join("odd.png"))
            .unwrap();
        fx.photo("room1.png", RED, BLUE);
        fx.reference("alice.png", RED);

        let (reports, diags, _) = run(&fx, ExtractOptions::default());

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].present_count(), 0);
        assert_eq!(reports[1].present_count(), 1);
        assert!(matches!(diags.iter().next(), Some(Diagnostic::DetectionFailed { .. })));
    }

    #[test]
    fn test_empty_gallery_gives_empty_reports() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);

        let (reports, diags, out) = run(&fx, ExtractOptions::default());

        assert_eq!(reports.len(), 1);
        assert!(reports[0].records.is_empty());
        assert!(diags.is_empty());
        assert_eq!(out, "Attendance for room1\n");
    }

    #[test]
    fn test_degenerate_crop_kept_as_placeholder() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        fx.reference("alice.png", RED);

        let mut extractor = FaceExtractor::new(TwoSeats {
            boxes: vec![BoundingBox::new(5, 5, 5, 15), BoundingBox::new(0, 0, 10, 10)],
        });
        let mut repo = fx.repo();
        let mut diags = Diagnostics::default();
        let summary = extract_classrooms(&mut extractor, &mut repo, &fx.input(), ExtractOptions::default(), &mut diags).unwrap();
        assert_eq!(summary[0].saved, 2);
        assert_eq!(std::fs::metadata(fx.work().join("room1/face_1.png")).unwrap().len(), 0);

        let mut matcher = AttendanceMatcher::new(SameColor);
        let mut emitter = ReportEmitter::new(Vec::new(), ReportFormat::Text);
        let reports = take_attendance(&mut matcher, &repo, &fx.gallery(), &mut emitter, &mut diags).unwrap();

        // The placeholder fails verification; face_2 still finds alice.
        assert_eq!(reports[0].status_of("alice"), Some(AttendanceStatus::Present));
        assert!(matches!(diags.iter().next(), Some(Diagnostic::VerificationFailed { .. })));
    }

    #[test]
    fn test_degenerate_crop_dropped_keeps_numbering() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);

        let mut extractor = FaceExtractor::new(TwoSeats {
            boxes: vec![BoundingBox::new(5, 5, 5, 15), BoundingBox::new(0, 0, 10, 10)],
        });
        let mut repo = fx.repo();
        let mut diags = Diagnostics::default();
        let options = ExtractOptions { keep_degenerate_crops: false };
        let summary = extract_classrooms(&mut extractor, &mut repo, &fx.input(), options, &mut diags).unwrap();

        assert_eq!(summary[0].detected, 2);
        assert_eq!(summary[0].saved, 1);
        assert!(!fx.work().join("room1/face_1.png").exists());
        assert!(fx.work().join("room1/face_2.png").exists());
    }

    /// Memory store whose `broken` classroom cannot be listed.
    struct UnlistableRoom {
        inner: MemoryClassroomRepository,
        broken: &'static str,
    }

    impl ClassroomRepository for UnlistableRoom {
        fn rebuild(&mut self) -> Result<(), RepositoryError> {
            self.inner.rebuild()
        }

        fn create_classroom(&mut self, name: &str) -> Result<ClassroomHandle, RepositoryError> {
            self.inner.create_classroom(name)
        }

        fn save_face(
            &mut self,
            classroom: &ClassroomHandle,
            crop: &FaceCrop,
        ) -> Result<PathBuf, RepositoryError> {
            self.inner.save_face(classroom, crop)
        }

        fn list_classrooms(&self) -> Result<Vec<String>, RepositoryError> {
            self.inner.list_classrooms()
        }

        fn open_classroom(&self, name: &str) -> Result<Option<ClassroomHandle>, RepositoryError> {
            self.inner.open_classroom(name)
        }

        fn list_faces(&self, classroom: &ClassroomHandle) -> Result<Vec<PathBuf>, RepositoryError> {
            if classroom.name == self.broken {
                return Err(RepositoryError::Io {
                    action: "list",
                    path: classroom.location.clone(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.inner.list_faces(classroom)
        }
    }

    /// Matches nothing, never fails.
    struct NobodyMatches;

    impl Verify for NobodyMatches {
        fn verify(&mut self, _face: &Path, _reference: &Path) -> Result<Verification, RecognizerError> {
            Ok(Verification { matched: false, distance: 1.0 })
        }
    }

    #[test]
    fn test_unlistable_classroom_is_skipped() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        fx.photo("room2.png", GREEN, GREEN);
        fx.reference("alice.png", RED);

        let mut repo = UnlistableRoom {
            inner: MemoryClassroomRepository::new("people"),
            broken: "room1",
        };
        let mut extractor = FaceExtractor::new(TwoSeats::new());
        let mut diags = Diagnostics::default();
        extract_classrooms(&mut extractor, &mut repo, &fx.input(), ExtractOptions::default(), &mut diags).unwrap();

        let mut matcher = AttendanceMatcher::new(NobodyMatches);
        let mut emitter = ReportEmitter::new(Vec::new(), ReportFormat::Text);
        let reports = take_attendance(&mut matcher, &repo, &fx.gallery(), &mut emitter, &mut diags).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].classroom, "room2");
        assert_eq!(
            diags.iter().collect::<Vec<_>>(),
            vec![&Diagnostic::ClassroomUnreadable {
                classroom: "room1".into(),
                reason: "cannot list people/room1: denied".into(),
            }]
        );
    }

    #[test]
    fn test_run_summary_line() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        std::fs::write(fx.input().join("broken.jpg"), b"nope").unwrap();

        let (reports, diags, _) = run(&fx, ExtractOptions::default());
        let summary = RunSummary::new(reports, diags);
        assert_eq!(summary.to_string(), "2 classrooms, 1 diagnostics");
    }

    #[test]
    fn test_missing_input_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = MemoryClassroomRepository::new("people");
        let mut extractor = FaceExtractor::new(TwoSeats::new());
        let mut diags = Diagnostics::default();

        let err = extract_classrooms(
            &mut extractor,
            &mut repo,
            &tmp.path().join("present"),
            ExtractOptions::default(),
            &mut diags,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Input { .. }));
    }

    #[test]
    fn test_in_memory_store_extraction() {
        let fx = Fixture::new();
        fx.photo("room1.png", RED, BLUE);
        fx.photo("room2.png", GREEN, GREEN);

        let mut repo = MemoryClassroomRepository::new("people");
        let mut extractor = FaceExtractor::new(TwoSeats::new());
        let mut diags = Diagnostics::default();
        extract_classrooms(&mut extractor, &mut repo, &fx.input(), ExtractOptions::default(), &mut diags).unwrap();

        assert_eq!(repo.face_count("room1"), 2);
        assert_eq!(*repo.face("room1", 2).unwrap().image.get_pixel(0, 0), BLUE);
        assert!(!fx.work().exists());
    }
}
