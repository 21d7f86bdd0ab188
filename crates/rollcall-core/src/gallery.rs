//! Gallery snapshot file.
//!
//! The snapshot is one JSON object holding three parallel arrays:
//! `encodings`, `names`, and `ids`, plus a fourth, `model_versions`, when
//! any entry carries one. serde_json writes the shortest float
//! text that parses back to the same `f32`, so a load after a save yields
//! bit-identical embeddings.

use crate::types::{Embedding, EnrolledFace};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write gallery snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery snapshot {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("embedding for '{identity}' contains a non-finite value")]
    NonFinite { identity: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    encodings: Vec<Vec<f32>>,
    names: Vec<String>,
    ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    model_versions: Vec<Option<String>>,
}

/// Read a gallery snapshot.
///
/// A missing file is reported as `GalleryError::Read` with `NotFound`; the
/// caller decides whether that is an empty gallery.
pub fn load(path: &Path) -> Result<Vec<EnrolledFace>, GalleryError> {
    let data = fs::read(path).map_err(|source| GalleryError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let snapshot: Snapshot =
        serde_json::from_slice(&data).map_err(|err| GalleryError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

    validate(path, &snapshot)?;

    let Snapshot {
        encodings,
        names,
        ids,
        model_versions,
    } = snapshot;
    let mut versions = model_versions.into_iter();

    Ok(encodings
        .into_iter()
        .zip(names)
        .zip(ids)
        .map(|((values, display_name), identity)| EnrolledFace {
            identity,
            display_name,
            embedding: Embedding {
                values,
                model_version: versions.next().flatten(),
            },
        })
        .collect())
}

fn validate(path: &Path, snapshot: &Snapshot) -> Result<(), GalleryError> {
    let corrupt = |message: String| GalleryError::Corrupt {
        path: path.to_path_buf(),
        message,
    };

    let n = snapshot.encodings.len();
    if snapshot.names.len() != n || snapshot.ids.len() != n {
        return Err(corrupt(format!(
            "parallel arrays differ in length: {} encodings, {} names, {} ids",
            n,
            snapshot.names.len(),
            snapshot.ids.len()
        )));
    }
    if !snapshot.model_versions.is_empty() && snapshot.model_versions.len() != n {
        return Err(corrupt(format!(
            "{} model versions for {n} encodings",
            snapshot.model_versions.len()
        )));
    }

    if let Some(first) = snapshot.encodings.first() {
        let dim = first.len();
        if dim == 0 {
            return Err(corrupt("empty encoding".into()));
        }
        if let Some(bad) = snapshot.encodings.iter().position(|e| e.len() != dim) {
            return Err(corrupt(format!(
                "encoding {bad} has {} values, expected {dim}",
                snapshot.encodings[bad].len()
            )));
        }
    }

    let mut seen = HashSet::with_capacity(n);
    for id in &snapshot.ids {
        if !seen.insert(id.as_str()) {
            return Err(corrupt(format!("duplicate identity '{id}'")));
        }
    }

    Ok(())
}

/// Atomically overwrite the snapshot at `path` with `faces`.
///
/// Writes to a temporary file in the same directory, syncs it, then renames
/// it over the target.
pub fn save(path: &Path, faces: &[EnrolledFace]) -> Result<(), GalleryError> {
    let write_err = |source: std::io::Error| GalleryError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // JSON has no NaN or infinity; serde_json would write `null`.
    if let Some(bad) = faces.iter().find(|f| !f.embedding.is_finite()) {
        return Err(GalleryError::NonFinite {
            identity: bad.identity.clone(),
        });
    }
    fs::create_dir_all(parent).map_err(write_err)?;

    let model_versions = if faces.iter().any(|f| f.embedding.model_version.is_some()) {
        faces.iter().map(|f| f.embedding.model_version.clone()).collect()
    } else {
        Vec::new()
    };
    let snapshot = Snapshot {
        encodings: faces.iter().map(|f| f.embedding.values.clone()).collect(),
        names: faces.iter().map(|f| f.display_name.clone()).collect(),
        ids: faces.iter().map(|f| f.identity.clone()).collect(),
        model_versions,
    };
    let serialized = serde_json::to_vec(&snapshot)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer.write_all(&serialized).map_err(write_err)?;
        writer.flush().map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;

    tracing::debug!(path = %path.display(), faces = faces.len(), "gallery snapshot written");
    Ok(())
}
