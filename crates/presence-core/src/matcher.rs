//! Cosine matching of a query embedding against an immutable gallery
//! snapshot.
//!
//! Both sides of the comparison are unit-norm, so cosine similarity reduces
//! to a dot product and the whole gallery is scored with one matrix-vector
//! product. Snapshots are built once and never mutated; the engine replaces
//! the whole snapshot atomically when the gallery changes.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::recognizer::{Embedding, EMBEDDING_DIM};

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("query embedding has wrong dimension: {0} (expected {EMBEDDING_DIM})")]
    QueryDimension(usize),
}

/// One enrolled gallery row. Identity keys may repeat — every embedding of
/// an identity participates in matching and the best single score wins.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
    pub quality: Option<f32>,
    pub source: Option<String>,
}

/// Immutable matching snapshot: a row-normalized embedding matrix plus the
/// parallel identity list. Built in one pass; published by reference swap.
pub struct GallerySnapshot {
    identities: Vec<String>,
    matrix: Array2<f32>,
}

impl GallerySnapshot {
    /// Build a snapshot from gallery entries. Rows are re-normalized
    /// defensively; entries whose embedding has a degenerate norm are
    /// skipped with a warning and never participate in matching.
    pub fn build(entries: &[GalleryEntry]) -> Self {
        let mut identities = Vec::with_capacity(entries.len());
        let mut rows = Vec::with_capacity(entries.len() * EMBEDDING_DIM);

        for entry in entries {
            let norm_sq: f32 = entry.embedding.values.iter().map(|v| v * v).sum();
            if entry.embedding.values.len() != EMBEDDING_DIM
                || !norm_sq.is_finite()
                || norm_sq <= 0.0
            {
                tracing::warn!(
                    identity = %entry.identity,
                    dim = entry.embedding.values.len(),
                    "skipping gallery entry with degenerate embedding"
                );
                continue;
            }
            let norm = norm_sq.sqrt();
            rows.extend(entry.embedding.values.iter().map(|v| v / norm));
            identities.push(entry.identity.clone());
        }

        let matrix = Array2::from_shape_vec((identities.len(), EMBEDDING_DIM), rows)
            .expect("row count and identity count are built in lockstep");
        Self { identities, matrix }
    }

    pub fn empty() -> Self {
        Self {
            identities: Vec::new(),
            matrix: Array2::zeros((0, EMBEDDING_DIM)),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Outcome of one gallery comparison. Ephemeral; created per query.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Best-matching identity, present only when accepted.
    pub identity: Option<String>,
    /// Best cosine similarity observed, reported even below threshold.
    pub similarity: f32,
    pub accepted: bool,
}

impl MatchResult {
    fn no_match(similarity: f32) -> Self {
        Self {
            identity: None,
            similarity,
            accepted: false,
        }
    }
}

/// Stateless cosine matcher. Never mutates the snapshot.
pub struct CosineMatcher;

impl CosineMatcher {
    /// Compare a query embedding against the snapshot.
    ///
    /// Deterministic: ties are broken by the first-encountered row. An
    /// empty snapshot yields `(None, 0.0, false)` without error.
    pub fn compare(
        &self,
        query: &Embedding,
        snapshot: &GallerySnapshot,
        threshold: f32,
    ) -> Result<MatchResult, MatcherError> {
        if query.values.len() != EMBEDDING_DIM {
            return Err(MatcherError::QueryDimension(query.values.len()));
        }
        if snapshot.is_empty() {
            return Ok(MatchResult::no_match(0.0));
        }

        let query_vec = Array1::from_vec(query.values.clone());
        let scores = snapshot.matrix.dot(&query_vec);

        // argmax with strict improvement: first index wins ties
        let mut best_idx = 0;
        let mut best_score = scores[0];
        for (idx, &score) in scores.iter().enumerate().skip(1) {
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }

        if best_score >= threshold {
            Ok(MatchResult {
                identity: Some(snapshot.identities[best_idx].clone()),
                similarity: best_score,
                accepted: true,
            })
        } else {
            Ok(MatchResult::no_match(best_score))
        }
    }
}
