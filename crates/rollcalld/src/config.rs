use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing the SCRFD and ArcFace ONNX models.
    pub model_dir: PathBuf,
    /// Gallery snapshot file.
    pub gallery_path: PathBuf,
    /// Path to the SQLite attendance ledger.
    pub db_path: PathBuf,
    /// Where registration photos are kept.
    pub upload_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub tolerance: f32,
    /// Default row limit for attendance reports.
    pub report_limit: usize,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = rollcall_core::default_data_dir();

        Self {
            model_dir: env_path("ROLLCALL_MODEL_DIR")
                .unwrap_or_else(rollcall_core::default_model_dir),
            gallery_path: env_path("ROLLCALL_GALLERY_PATH")
                .unwrap_or_else(|| data_dir.join("face_encodings.json")),
            db_path: env_path("ROLLCALL_DB_PATH").unwrap_or_else(|| data_dir.join("attendance.db")),
            upload_dir: env_path("ROLLCALL_UPLOAD_DIR").unwrap_or_else(|| data_dir.join("uploads")),
            tolerance: env_f32("ROLLCALL_TOLERANCE", rollcall_core::DEFAULT_TOLERANCE),
            report_limit: env_usize(
                "ROLLCALL_REPORT_LIMIT",
                rollcall_core::ledger::DEFAULT_REPORT_LIMIT,
            ),
            system_bus: std::env::var("ROLLCALL_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f32| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
