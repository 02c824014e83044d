//! Attendance matching for one classroom.
//!
//! Every stored face is compared against every identity that is still Absent,
//! in gallery order. The first identity a face verifies against is marked
//! Present and that face is not compared any further. An identity that is
//! Present is never compared again, so later faces only pay for the
//! identities still missing.

use crate::gallery::IdentityGallery;
use crate::recognizer::Verify;
use crate::repository::{ClassroomRepository, RepositoryError};
use crate::types::{AttendanceReport, AttendanceStatus, Diagnostic, Diagnostics};
use std::path::{Path, PathBuf};

/// Result of comparing one face against one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Matched,
    NotMatched,
    Failed(String),
}

pub struct AttendanceMatcher<V> {
    verifier: V,
}

impl<V: Verify> AttendanceMatcher<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    /// Take attendance for the classroom `name` held in `repo`.
    ///
    /// Returns `None` when the bucket is missing or cannot be read; the
    /// reason is recorded as a diagnostic and other classrooms are unaffected.
    pub fn match_classroom<R: ClassroomRepository + ?Sized>(
        &mut self,
        repo: &R,
        name: &str,
        gallery: &IdentityGallery,
        diagnostics: &mut Diagnostics,
    ) -> Option<AttendanceReport> {
        let unreadable = |e: RepositoryError| Diagnostic::ClassroomUnreadable {
            classroom: name.to_string(),
            reason: e.to_string(),
        };

        let classroom = match repo.open_classroom(name) {
            Ok(Some(classroom)) => classroom,
            Ok(None) => {
                diagnostics.record(Diagnostic::ClassroomMissing {
                    classroom: name.to_string(),
                });
                return None;
            }
            Err(e) => {
                diagnostics.record(unreadable(e));
                return None;
            }
        };

        let faces = match repo.list_faces(&classroom) {
            Ok(faces) => faces,
            Err(e) => {
                diagnostics.record(unreadable(e));
                return None;
            }
        };
        tracing::debug!(
            classroom = name,
            faces = faces.len(),
            identities = gallery.len(),
            "matching classroom"
        );
        Some(self.match_faces(name, &faces, gallery, diagnostics))
    }

    /// Core loop over an already-enumerated face set.
    pub fn match_faces(
        &mut self,
        classroom: &str,
        faces: &[PathBuf],
        gallery: &IdentityGallery,
        diagnostics: &mut Diagnostics,
    ) -> AttendanceReport {
        let mut report = AttendanceReport::all_absent(classroom, gallery.names());

        for face in faces {
            if report.all_present() {
                break;
            }

            for (pos, identity) in gallery.iter().enumerate() {
                if report.records[pos].status == AttendanceStatus::Present {
                    continue;
                }

                match self.compare(face, &identity.reference) {
                    Comparison::Matched => {
                        report.mark_present(pos);
                        tracing::info!(
                            classroom,
                            identity = %identity.name,
                            face = %face.display(),
                            "identity present"
                        );
                        break;
                    }
                    Comparison::NotMatched => {}
                    Comparison::Failed(reason) => {
                        diagnostics.record(Diagnostic::VerificationFailed {
                            face: face.clone(),
                            reference: identity.reference.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        report
    }

    fn compare(&mut self, face: &Path, reference: &Path) -> Comparison {
        match self.verifier.verify(face, reference) {
            Ok(v) => {
                tracing::debug!(
                    face = %face.display(),
                    reference = %reference.display(),
                    matched = v.matched,
                    distance = v.distance,
                    "verified pair"
                );
                if v.matched {
                    Comparison::Matched
                } else {
                    Comparison::NotMatched
                }
            }
            Err(e) => Comparison::Failed(e.to_string()),
        }
    }
}
