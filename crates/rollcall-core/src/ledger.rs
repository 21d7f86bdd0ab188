//! Attendance ledger: enrolled students and their attendance events.

use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::{ffi, params, Connection};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Default number of rows returned by `attendance_records`.
pub const DEFAULT_REPORT_LIMIT: usize = 100;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    image_path TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL,
    name TEXT NOT NULL,
    date DATE NOT NULL,
    time TIME NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    FOREIGN KEY (student_id) REFERENCES students (student_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS attendance_student_date
    ON attendance (student_id, date);
";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("student '{0}' already exists")]
    DuplicateStudent(String),
    #[error("attendance already recorded for '{student_id}' on {date}")]
    AlreadyRecorded { student_id: String, date: NaiveDate },
    #[error("student '{0}' is not registered")]
    UnknownStudent(String),
    #[error("failed to create ledger directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A registered student.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub image_path: Option<String>,
    pub created_at: String,
}

/// One attendance event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub name: String,
    pub date: String,
    pub time: String,
    pub timestamp: String,
}

/// Persistent record of students and attendance events.
pub trait AttendanceLedger {
    fn add_student(
        &self,
        student_id: &str,
        name: &str,
        image_path: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Undo `add_student`. Returns whether a row was removed.
    fn remove_student(&self, student_id: &str) -> Result<bool, LedgerError>;

    fn is_enrolled(&self, student_id: &str) -> Result<bool, LedgerError>;

    fn has_record_on(&self, student_id: &str, date: NaiveDate) -> Result<bool, LedgerError>;

    /// Record attendance at `at`. At most one event per student per day.
    fn record(&self, student_id: &str, name: &str, at: NaiveDateTime) -> Result<(), LedgerError>;

    /// Most recent events first.
    fn attendance_records(&self, limit: usize) -> Result<Vec<AttendanceRecord>, LedgerError>;

    fn students(&self) -> Result<Vec<Student>, LedgerError>;

    fn has_record_today(&self, student_id: &str) -> Result<bool, LedgerError> {
        self.has_record_on(student_id, Local::now().date_naive())
    }

    fn record_now(&self, student_id: &str, name: &str) -> Result<(), LedgerError> {
        self.record(student_id, name, Local::now().naive_local())
    }
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

fn constraint_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
        _ => None,
    }
}

impl AttendanceLedger for SqliteLedger {
    fn add_student(
        &self,
        student_id: &str,
        name: &str,
        image_path: Option<&str>,
    ) -> Result<(), LedgerError> {
        let res = self.conn.execute(
            "INSERT INTO students (student_id, name, image_path) VALUES (?1, ?2, ?3)",
            params![student_id, name, image_path],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if constraint_code(&e) == Some(ffi::SQLITE_CONSTRAINT_UNIQUE) => {
                Err(LedgerError::DuplicateStudent(student_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove_student(&self, student_id: &str) -> Result<bool, LedgerError> {
        let deleted = self
            .conn
            .execute("DELETE FROM students WHERE student_id = ?1", params![student_id])?;
        Ok(deleted > 0)
    }

    fn is_enrolled(&self, student_id: &str) -> Result<bool, LedgerError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM students WHERE student_id = ?1",
            params![student_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn has_record_on(&self, student_id: &str, date: NaiveDate) -> Result<bool, LedgerError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE student_id = ?1 AND date = ?2",
            params![student_id, date.format(DATE_FORMAT).to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record(&self, student_id: &str, name: &str, at: NaiveDateTime) -> Result<(), LedgerError> {
        let date = at.date();
        if self.has_record_on(student_id, date)? {
            return Err(LedgerError::AlreadyRecorded {
                student_id: student_id.to_string(),
                date,
            });
        }

        let res = self.conn.execute(
            "INSERT INTO attendance (student_id, name, date, time, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                student_id,
                name,
                at.format(DATE_FORMAT).to_string(),
                at.format(TIME_FORMAT).to_string(),
                at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        );
        match res {
            Ok(_) => {
                tracing::debug!(student_id, %date, "attendance recorded");
                Ok(())
            }
            Err(e) => match constraint_code(&e) {
                Some(ffi::SQLITE_CONSTRAINT_UNIQUE) => Err(LedgerError::AlreadyRecorded {
                    student_id: student_id.to_string(),
                    date,
                }),
                Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => {
                    Err(LedgerError::UnknownStudent(student_id.to_string()))
                }
                _ => Err(e.into()),
            },
        }
    }

    fn attendance_records(&self, limit: usize) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, name, date, time, timestamp
             FROM attendance
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AttendanceRecord {
                student_id: row.get(0)?,
                name: row.get(1)?,
                date: row.get(2)?,
                time: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn students(&self) -> Result<Vec<Student>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id, name, image_path, created_at FROM students ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Student {
                student_id: row.get(0)?,
                name: row.get(1)?,
                image_path: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
