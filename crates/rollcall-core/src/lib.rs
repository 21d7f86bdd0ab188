//! rollcall-core: face gallery matching and attendance bookkeeping.
//!
//! Enrolled faces live in a `GalleryStore` backed by a snapshot file;
//! attendance events live in a SQLite ledger. Embeddings come from SCRFD
//! detection and ArcFace recognition running on ONNX Runtime.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod recognizer;
pub mod store;
pub mod types;

pub use attendance::{AttendanceDesk, DeskError, MarkOutcome};
pub use extractor::{default_model_dir, EmbeddingExtractor, ExtractError, OnnxExtractor};
pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError, SqliteLedger, Student};
pub use store::{GalleryStore, StoreError};
pub use types::{BoundingBox, Embedding, EnrolledFace, MatchOutcome, DEFAULT_TOLERANCE};

use std::path::PathBuf;

/// Data directory: `$XDG_DATA_HOME/rollcall`, else `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
