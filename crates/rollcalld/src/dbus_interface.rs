use crate::engine::{EngineError, EngineHandle, Registered};
use rollcall_core::{DeskError, ExtractError, LedgerError, MarkOutcome, StoreError};
use serde_json::json;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    report_limit: usize,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, report_limit: usize) -> Self {
        Self {
            engine,
            report_limit,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Register a student from a face photo.
    async fn register(&self, student_id: &str, name: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(student_id, name, bytes = image.len(), "register requested");
        if image.is_empty() {
            return Err(fdo::Error::InvalidArgs("image is required".into()));
        }
        let result = self
            .engine
            .register(student_id.to_string(), name.to_string(), image)
            .await;
        register_reply(result)
    }

    /// Recognize the photo and mark attendance for today.
    async fn mark_attendance(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "mark_attendance requested");
        if image.is_empty() {
            return Err(fdo::Error::InvalidArgs("no image data received".into()));
        }
        mark_reply(self.engine.mark(image).await)
    }

    /// Most recent attendance records. A limit of 0 uses the configured default.
    async fn reports(&self, limit: u32) -> fdo::Result<String> {
        let limit = if limit == 0 {
            self.report_limit
        } else {
            limit as usize
        };
        let records = self.engine.reports(limit).await.map_err(into_fdo)?;
        Ok(json!({ "success": true, "records": records }).to_string())
    }

    /// All registered students.
    async fn students(&self) -> fdo::Result<String> {
        let students = self.engine.students().await.map_err(into_fdo)?;
        Ok(json!({ "success": true, "students": students }).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(into_fdo)?;
        Ok(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled_faces": status.enrolled_faces,
            "tolerance": status.tolerance,
        })
        .to_string())
    }
}

fn failure(message: impl Into<String>) -> String {
    json!({ "success": false, "message": message.into() }).to_string()
}

/// Errors that are the caller's fault or a normal negative answer become a
/// `success: false` reply; everything else is a D-Bus error.
fn register_reply(result: Result<Registered, EngineError>) -> fdo::Result<String> {
    match result {
        Ok(reg) => Ok(json!({
            "success": true,
            "message": format!("Student {} registered successfully!", reg.name),
            "student": { "student_id": reg.student_id, "name": reg.name },
        })
        .to_string()),
        Err(EngineError::Desk(DeskError::Store(StoreError::NoFaceDetected)))
        | Err(EngineError::Desk(DeskError::Store(StoreError::NoEmbeddingProvided))) => {
            Ok(failure("Failed to detect face in image!"))
        }
        Err(EngineError::Desk(DeskError::AlreadyRegistered(id)))
        | Err(EngineError::Desk(DeskError::Store(StoreError::DuplicateIdentity(id))))
        | Err(EngineError::Desk(DeskError::Ledger(LedgerError::DuplicateStudent(id)))) => {
            Ok(failure(format!("Student ID {id} already exists!")))
        }
        Err(err) => Err(into_fdo(err)),
    }
}

fn mark_reply(result: Result<MarkOutcome, EngineError>) -> fdo::Result<String> {
    match result {
        Ok(MarkOutcome::Marked {
            student_id,
            name,
            confidence,
        }) => Ok(json!({
            "success": true,
            "message": format!("Attendance marked successfully for {name}!"),
            "student": { "name": name, "student_id": student_id, "confidence": confidence },
        })
        .to_string()),
        Ok(MarkOutcome::AlreadyMarked { name, .. }) => {
            Ok(failure(format!("Attendance already marked for {name} today!")))
        }
        Ok(MarkOutcome::NotRecognized(outcome)) => {
            Ok(failure(outcome.message().unwrap_or("Face not recognized")))
        }
        Err(err) => Err(into_fdo(err)),
    }
}

fn into_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Extract(ExtractError::Decode(e)) => {
            fdo::Error::InvalidArgs(format!("unreadable image: {e}"))
        }
        EngineError::Desk(DeskError::MissingField(field)) => {
            fdo::Error::InvalidArgs(format!("{field} is required"))
        }
        EngineError::Desk(DeskError::Store(
            e @ (StoreError::DimensionMismatch { .. } | StoreError::NonFiniteEmbedding),
        )) => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}
