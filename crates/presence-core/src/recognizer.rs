//! Face embedding extraction and normalization.
//!
//! The embedding model itself (ArcFace or equivalent) is an external
//! capability behind [`EmbeddingModel`]; this module owns what happens to
//! its raw output: dimension and finiteness validation, L2 normalization,
//! and rejection of degenerate vectors. A zero-norm vector is never divided
//! and never leaves this boundary.

use image::RgbImage;
use thiserror::Error;

/// Embedding dimension produced by the recognition model.
pub const EMBEDDING_DIM: usize = 512;

/// Tolerance for the unit-norm invariant.
const NORM_EPSILON: f32 = 1e-4;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model inference failed: {0}")]
    Inference(String),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidDimension(usize),
    #[error("embedding contains non-finite values")]
    NonFiniteValue,
    #[error("degenerate embedding (zero norm) — extraction failed")]
    DegenerateEmbedding,
}

/// A unit-norm face embedding. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding from a raw model output vector, normalizing to
    /// unit length. Rejects wrong dimensions, NaN/Inf values, and the
    /// zero vector.
    pub fn from_raw(
        raw: Vec<f32>,
        model_version: Option<String>,
    ) -> Result<Self, RecognizerError> {
        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InvalidDimension(raw.len()));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::NonFiniteValue);
        }

        let norm_sq: f32 = raw.iter().map(|v| v * v).sum();
        if !norm_sq.is_finite() || norm_sq <= 0.0 {
            return Err(RecognizerError::DegenerateEmbedding);
        }

        let norm = norm_sq.sqrt();
        let values = raw.into_iter().map(|v| v / norm).collect();
        Ok(Self {
            values,
            model_version,
        })
    }

    /// Euclidean norm; ≈ 1.0 for any embedding this module produced.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_unit_norm(&self) -> bool {
        (self.norm() - 1.0).abs() < NORM_EPSILON
    }
}

/// External face-embedding model. Weights are loaded once at construction
/// and treated as read-only afterwards; `infer` takes `&mut self` only so
/// implementations may reuse inference scratch buffers.
pub trait EmbeddingModel: Send {
    /// Run the model on an already-cropped RGB face region and return the
    /// raw (un-normalized) output vector.
    fn infer(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError>;

    /// Identifier recorded alongside enrolled embeddings.
    fn version(&self) -> Option<String> {
        None
    }
}

/// Wraps an [`EmbeddingModel`] and enforces the output contract: every
/// extracted embedding is validated and unit-normalized.
pub struct FeatureExtractor {
    model: Box<dyn EmbeddingModel>,
}

impl FeatureExtractor {
    pub fn new(model: Box<dyn EmbeddingModel>) -> Self {
        Self { model }
    }

    /// Extract a normalized embedding from a cropped RGB face region.
    pub fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let raw = self.model.infer(face)?;
        Embedding::from_raw(raw, self.model.version())
    }
}
