use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns raw image bytes into face embeddings.
pub trait EmbeddingExtractor {
    /// Zero or more embeddings, most confident face first.
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError>;
}

/// SCRFD detection + ArcFace recognition.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let faces = self.detector.detect(&rgb)?;
        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            faces = faces.len(),
            "extract: faces detected"
        );

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            match self.recognizer.extract(&rgb, face) {
                Ok(e) => embeddings.push(e),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(embeddings)
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`, falling back
/// to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    crate::default_data_dir().join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_without_models() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = OnnxExtractor::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            ExtractError::Detector(DetectorError::ModelNotFound(ref p)) if p.ends_with(SCRFD_MODEL_FILE)
        ));
    }
}
