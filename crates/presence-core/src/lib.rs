//! Presence core — the biometric decision engine.
//!
//! Turns a camera frame into three verdicts:
//!
//! - **recognizer**: a unit-norm 512-d face embedding (or a typed failure),
//! - **liveness**: a smoothed real/fake confidence fused from per-frame
//!   texture evidence and temporal motion over bounded histories,
//! - **matcher**: the best cosine match against an immutable gallery
//!   snapshot, accepted against a single configured threshold.
//!
//! The crate is pure: no camera, no database, no network. Face detection and
//! the embedding model are consumed through the [`detector::FaceDetector`]
//! and [`recognizer::EmbeddingModel`] traits so the daemon can wire in real
//! inference and tests can wire in stubs.

pub mod detector;
pub mod history;
pub mod liveness;
pub mod matcher;
pub mod recognizer;

pub use detector::{BoundingBox, Detection, DetectorError, FaceDetector, Landmarks};
pub use history::History;
pub use liveness::{LivenessConfig, LivenessSample, LivenessScorer, SpoofModel};
pub use matcher::{CosineMatcher, GalleryEntry, GallerySnapshot, MatchResult, MatcherError};
pub use recognizer::{Embedding, EmbeddingModel, FeatureExtractor, RecognizerError, EMBEDDING_DIM};
