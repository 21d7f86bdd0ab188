use serde::{Deserialize, Serialize};

/// Default match tolerance, calibrated for the extractor's embedding space.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector. Dimensionality is fixed by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Wrap raw values with no model version attached.
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every value is neither NaN nor infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings of equal length.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One gallery entry: a student and the face embedding enrolled for them.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledFace {
    pub identity: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Result of matching candidate faces against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NoFaceDetected,
    NoGalleryEntries,
    NoMatch,
    Matched {
        identity: String,
        display_name: String,
        /// Score in [0, 100], rounded to two decimals.
        confidence: f32,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }

    /// Short user-facing description of a negative outcome; `None` for a match.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            MatchOutcome::NoFaceDetected => Some("No face detected"),
            MatchOutcome::NoGalleryEntries => Some("No known faces available"),
            MatchOutcome::NoMatch => Some("Face not recognized"),
            MatchOutcome::Matched { .. } => None,
        }
    }
}

/// Map a match distance to a confidence score.
///
/// `(1 - distance) * 100`, rounded to two decimals and clamped to [0, 100].
pub fn confidence_from_distance(distance: f32) -> f32 {
    let raw = (1.0 - distance) * 100.0;
    let rounded = (raw * 100.0).round() / 100.0;
    if rounded.is_nan() {
        return 0.0;
    }
    rounded.clamp(0.0, 100.0)
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledFace], tolerance: f32) -> MatchOutcome;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Linear scan with a stable argmin: on equal distances the entry enrolled
/// first wins. NaN distances never win.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledFace], tolerance: f32) -> MatchOutcome {
        if gallery.is_empty() {
            return MatchOutcome::NoGalleryEntries;
        }

        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, face) in gallery.iter().enumerate() {
            let dist = probe.euclidean_distance(&face.embedding);
            if (best_idx.is_none() && !dist.is_nan()) || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= tolerance => MatchOutcome::Matched {
                identity: gallery[idx].identity.clone(),
                display_name: gallery[idx].display_name.clone(),
                confidence: confidence_from_distance(best_dist),
            },
            _ => MatchOutcome::NoMatch,
        }
    }
}
