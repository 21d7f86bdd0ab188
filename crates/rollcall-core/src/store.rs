//! Enrollment and matching store.
//!
//! `GalleryStore` owns the in-memory gallery and its snapshot file. It is
//! opened once at startup and every successful enrollment is flushed to
//! disk before returning. A failed flush rolls the append back, so memory
//! and disk hold the same gallery at all times.

use crate::gallery::{self, GalleryError};
use crate::types::{Embedding, EnrolledFace, EuclideanMatcher, MatchOutcome, Matcher};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity '{0}' is already enrolled")]
    DuplicateIdentity(String),
    #[error("no embedding provided")]
    NoEmbeddingProvided,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding contains NaN or infinite values")]
    NonFiniteEmbedding,
    #[error("embedding has {actual} values, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("storage write failed: {0}")]
    StorageWriteFailure(#[source] GalleryError),
}

pub struct GalleryStore {
    path: PathBuf,
    faces: Vec<EnrolledFace>,
}

impl GalleryStore {
    /// Open the store backed by the snapshot at `path`.
    ///
    /// Never fails: a missing snapshot starts an empty gallery, and an
    /// unreadable or corrupt one is logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let faces = match gallery::load(&path) {
            Ok(faces) => {
                tracing::info!(path = %path.display(), count = faces.len(), "loaded face gallery");
                faces
            }
            Err(GalleryError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::info!(path = %path.display(), "no gallery snapshot yet; starting empty");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(error = %err, "gallery snapshot unusable; starting empty");
                Vec::new()
            }
        };
        Self { path, faces }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn faces(&self) -> &[EnrolledFace] {
        &self.faces
    }

    /// Embedding length shared by every entry, if any are enrolled.
    pub fn dimension(&self) -> Option<usize> {
        self.faces.first().map(|f| f.embedding.len())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.faces.iter().any(|f| f.identity == identity)
    }

    /// Append a face and persist the gallery.
    pub fn enroll(
        &mut self,
        identity: &str,
        display_name: &str,
        embedding: Embedding,
    ) -> Result<(), StoreError> {
        if embedding.is_empty() {
            return Err(StoreError::NoEmbeddingProvided);
        }
        if !embedding.is_finite() {
            return Err(StoreError::NonFiniteEmbedding);
        }
        if self.contains(identity) {
            return Err(StoreError::DuplicateIdentity(identity.to_string()));
        }
        self.check_dimension(&embedding)?;

        self.faces.push(EnrolledFace {
            identity: identity.to_string(),
            display_name: display_name.to_string(),
            embedding,
        });

        if let Err(err) = gallery::save(&self.path, &self.faces) {
            self.faces.pop();
            tracing::error!(error = %err, identity, "gallery flush failed; enrollment rolled back");
            return Err(StoreError::StorageWriteFailure(err));
        }

        tracing::info!(identity, display_name, total = self.faces.len(), "face enrolled");
        Ok(())
    }

    /// Enroll the first face found in an image.
    pub fn enroll_first(
        &mut self,
        identity: &str,
        display_name: &str,
        faces: &[Embedding],
    ) -> Result<(), StoreError> {
        let first = faces.first().ok_or(StoreError::NoFaceDetected)?;
        self.enroll(identity, display_name, first.clone())
    }

    /// Match one candidate embedding against the gallery.
    pub fn identify(&self, candidate: &Embedding, tolerance: f32) -> Result<MatchOutcome, StoreError> {
        if self.faces.is_empty() {
            return Ok(MatchOutcome::NoGalleryEntries);
        }
        self.check_dimension(candidate)?;
        Ok(EuclideanMatcher.compare(candidate, &self.faces, tolerance))
    }

    /// Match every face found in an image, in order; the first positive
    /// match wins.
    pub fn identify_any(
        &self,
        faces: &[Embedding],
        tolerance: f32,
    ) -> Result<MatchOutcome, StoreError> {
        if faces.is_empty() {
            return Ok(MatchOutcome::NoFaceDetected);
        }
        for face in faces {
            match self.identify(face, tolerance)? {
                MatchOutcome::NoMatch => continue,
                outcome => return Ok(outcome),
            }
        }
        Ok(MatchOutcome::NoMatch)
    }

    /// Write the current gallery to its snapshot file.
    pub fn flush(&self) -> Result<(), StoreError> {
        gallery::save(&self.path, &self.faces).map_err(StoreError::StorageWriteFailure)
    }

    /// Flush and release the store.
    pub fn close(self) -> Result<(), StoreError> {
        self.flush()?;
        tracing::info!(path = %self.path.display(), "gallery closed");
        Ok(())
    }

    fn check_dimension(&self, embedding: &Embedding) -> Result<(), StoreError> {
        match self.dimension() {
            Some(expected) if expected != embedding.len() => Err(StoreError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn open_temp() -> (TempDir, GalleryStore) {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path().join("faces.json"));
        (dir, store)
    }

    #[test]
    fn test_open_missing_snapshot_is_empty() {
        let (_dir, store) = open_temp();
        assert!(store.is_empty());
        assert_eq!(store.dimension(), None);
    }

    #[test]
    fn test_open_corrupt_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.json");
        std::fs::write(&path, b"{ truncated").unwrap();
        let store = GalleryStore::open(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_persists_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.json");
        {
            let mut store = GalleryStore::open(&path);
            store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
            store.enroll("S2", "Bob", emb(&[0.0, 1.0, 0.0])).unwrap();
            store.close().unwrap();
        }
        let store = GalleryStore::open(&path);
        assert_eq!(store.len(), 2);
        assert_eq!(store.faces()[0].identity, "S1");
        assert_eq!(store.faces()[1].display_name, "Bob");
    }

    #[test]
    fn test_enroll_duplicate_identity() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0])).unwrap();
        let err = store.enroll("S1", "Alice Again", emb(&[0.0, 1.0])).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(ref id) if id == "S1"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.faces()[0].display_name, "Alice");
    }

    #[test]
    fn test_enroll_empty_embedding() {
        let (_dir, mut store) = open_temp();
        let err = store.enroll("S1", "Alice", emb(&[])).unwrap_err();
        assert!(matches!(err, StoreError::NoEmbeddingProvided));
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_rejects_non_finite_and_keeps_gallery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.json");
        let mut store = GalleryStore::open(&path);
        store.enroll("S1", "Alice", emb(&[1.0, 0.0])).unwrap();

        for bad in [f32::NAN, f32::INFINITY] {
            let err = store.enroll("S2", "Bob", emb(&[bad, 0.0])).unwrap_err();
            assert!(matches!(err, StoreError::NonFiniteEmbedding));
        }
        assert_eq!(store.len(), 1);

        store.enroll("S3", "Carol", emb(&[0.0, 1.0])).unwrap();
        let reopened = GalleryStore::open(&path);
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains("S1"));
        assert!(reopened.contains("S3"));
    }

    #[test]
    fn test_enroll_dimension_mismatch() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let err = store.enroll("S2", "Bob", emb(&[1.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_enroll_first_without_faces() {
        let (_dir, mut store) = open_temp();
        let err = store.enroll_first("S1", "Alice", &[]).unwrap_err();
        assert!(matches!(err, StoreError::NoFaceDetected));
    }

    #[test]
    fn test_enroll_first_uses_first_face() {
        let (_dir, mut store) = open_temp();
        store
            .enroll_first("S1", "Alice", &[emb(&[1.0, 0.0]), emb(&[0.0, 1.0])])
            .unwrap();
        assert_eq!(store.faces()[0].embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_write_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        // A directory at the snapshot path makes the final rename fail.
        let path = dir.path().join("faces.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let mut store = GalleryStore::open(&path);
        let err = store.enroll("S1", "Alice", emb(&[1.0])).unwrap_err();
        assert!(matches!(err, StoreError::StorageWriteFailure(_)));
        assert!(store.is_empty());
        assert!(!store.contains("S1"));
    }

    #[test]
    fn test_identify_empty_gallery() {
        let (_dir, store) = open_temp();
        for tolerance in [0.0, 0.6, 100.0] {
            assert_eq!(
                store.identify(&emb(&[0.2, 0.4]), tolerance).unwrap(),
                MatchOutcome::NoGalleryEntries
            );
        }
    }

    #[test]
    fn test_identify_enrolled_embedding_full_confidence() {
        let (_dir, mut store) = open_temp();
        let e = emb(&[0.12, -0.5, 0.33, 0.8]);
        store.enroll("S7", "Grace", e.clone()).unwrap();
        for tolerance in [0.0, 0.6, 2.0] {
            assert_eq!(
                store.identify(&e, tolerance).unwrap(),
                MatchOutcome::Matched {
                    identity: "S7".into(),
                    display_name: "Grace".into(),
                    confidence: 100.0,
                }
            );
        }
    }

    #[test]
    fn test_identify_confidence_clamped_for_wide_tolerance() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[0.0, 0.0])).unwrap();
        match store.identify(&emb(&[3.0, 4.0]), 10.0).unwrap() {
            MatchOutcome::Matched { confidence, .. } => assert_eq!(confidence, 0.0),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_identify_dimension_mismatch() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        assert!(matches!(
            store.identify(&emb(&[1.0, 0.0]), 0.6),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_identify_any_no_faces() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        assert_eq!(store.identify_any(&[], 0.6).unwrap(), MatchOutcome::NoFaceDetected);
    }

    #[test]
    fn test_identify_any_first_match_wins() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        store.enroll("S2", "Bob", emb(&[0.0, 0.0, 1.0])).unwrap();

        let faces = [emb(&[0.0, 1.0, 0.0]), emb(&[0.0, 0.0, 1.0]), emb(&[1.0, 0.0, 0.0])];
        match store.identify_any(&faces, 0.6).unwrap() {
            MatchOutcome::Matched { identity, .. } => assert_eq!(identity, "S2"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_identify_any_none_match() {
        let (_dir, mut store) = open_temp();
        store.enroll("S1", "Alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let faces = [emb(&[0.0, 1.0, 0.0]), emb(&[0.0, 0.0, 1.0])];
        assert_eq!(store.identify_any(&faces, 0.6).unwrap(), MatchOutcome::NoMatch);
    }
}
