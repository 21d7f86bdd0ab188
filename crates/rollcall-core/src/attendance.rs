//! Registration and attendance flows over the gallery store and the ledger.

use crate::ledger::{AttendanceLedger, AttendanceRecord, LedgerError, Student};
use crate::store::{GalleryStore, StoreError};
use crate::types::{Embedding, MatchOutcome};
use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeskError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("student '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("matched '{0}' but the student is missing from the ledger")]
    UnknownStudent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of a mark-attendance request.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked {
        student_id: String,
        name: String,
        confidence: f32,
    },
    AlreadyMarked {
        student_id: String,
        name: String,
    },
    NotRecognized(MatchOutcome),
}

/// Front desk: owns the gallery and the ledger and keeps them consistent.
pub struct AttendanceDesk<L> {
    gallery: GalleryStore,
    ledger: L,
    tolerance: f32,
}

impl<L: AttendanceLedger> AttendanceDesk<L> {
    pub fn new(gallery: GalleryStore, ledger: L, tolerance: f32) -> Self {
        Self {
            gallery,
            ledger,
            tolerance,
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Whether `student_id` is already in the gallery or the ledger.
    pub fn is_registered(&self, student_id: &str) -> Result<bool, DeskError> {
        Ok(self.gallery.contains(student_id) || self.ledger.is_enrolled(student_id)?)
    }

    /// Register a student with the first face in `faces`.
    ///
    /// The ledger row is written first; if the gallery enrollment then fails
    /// the row is removed again. Returns the trimmed (id, name).
    pub fn register(
        &mut self,
        student_id: &str,
        name: &str,
        faces: &[Embedding],
        image_path: Option<&str>,
    ) -> Result<(String, String), DeskError> {
        let (student_id, name) = validate_identity(student_id, name)?;

        if self.is_registered(student_id)? {
            return Err(DeskError::AlreadyRegistered(student_id.to_string()));
        }
        // Checked before touching the ledger so a faceless image leaves no row.
        if faces.is_empty() {
            return Err(StoreError::NoFaceDetected.into());
        }

        self.ledger
            .add_student(student_id, name, image_path)
            .map_err(|e| match e {
                LedgerError::DuplicateStudent(id) => DeskError::AlreadyRegistered(id),
                other => other.into(),
            })?;

        if let Err(err) = self.gallery.enroll_first(student_id, name, faces) {
            if let Err(undo) = self.ledger.remove_student(student_id) {
                tracing::error!(error = %undo, student_id, "failed to remove ledger row after enrollment failure");
            }
            return Err(err.into());
        }

        tracing::info!(student_id, name, "student registered");
        Ok((student_id.to_string(), name.to_string()))
    }

    /// Match `faces` against the gallery and record attendance at `now`.
    pub fn mark(&self, faces: &[Embedding], now: NaiveDateTime) -> Result<MarkOutcome, DeskError> {
        let (identity, display_name, confidence) =
            match self.gallery.identify_any(faces, self.tolerance)? {
                MatchOutcome::Matched {
                    identity,
                    display_name,
                    confidence,
                } => (identity, display_name, confidence),
                outcome => {
                    tracing::debug!(?outcome, "attendance: face not recognized");
                    return Ok(MarkOutcome::NotRecognized(outcome));
                }
            };

        if !self.ledger.is_enrolled(&identity)? {
            return Err(DeskError::UnknownStudent(identity));
        }

        if self.ledger.has_record_on(&identity, now.date())? {
            tracing::info!(student_id = %identity, "attendance already marked today");
            return Ok(MarkOutcome::AlreadyMarked {
                student_id: identity,
                name: display_name,
            });
        }

        match self.ledger.record(&identity, &display_name, now) {
            Ok(()) => {}
            Err(LedgerError::AlreadyRecorded { .. }) => {
                return Ok(MarkOutcome::AlreadyMarked {
                    student_id: identity,
                    name: display_name,
                })
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(student_id = %identity, confidence, "attendance marked");
        Ok(MarkOutcome::Marked {
            student_id: identity,
            name: display_name,
            confidence,
        })
    }

    pub fn reports(&self, limit: usize) -> Result<Vec<AttendanceRecord>, DeskError> {
        Ok(self.ledger.attendance_records(limit)?)
    }

    pub fn students(&self) -> Result<Vec<Student>, DeskError> {
        Ok(self.ledger.students()?)
    }

    /// Flush the gallery and release both stores.
    pub fn close(self) -> Result<(), DeskError> {
        self.gallery.close()?;
        Ok(())
    }
}

/// Trim and require a non-empty student id and name.
pub fn validate_identity<'a>(student_id: &'a str, name: &'a str) -> Result<(&'a str, &'a str), DeskError> {
    let student_id = student_id.trim();
    let name = name.trim();
    if name.is_empty() {
        return Err(DeskError::MissingField("name"));
    }
    if student_id.is_empty() {
        return Err(DeskError::MissingField("student id"));
    }
    Ok((student_id, name))
}
