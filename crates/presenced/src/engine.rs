//! The attendance decider: one frame in, one structured outcome out.
//!
//! A dedicated engine task owns everything mutable — the detector and
//! embedding model handles, one liveness scorer per tracking session, and
//! the current gallery snapshot. Callers hold a cloneable [`EngineHandle`]
//! and talk to the task over an mpsc channel with oneshot replies, so no
//! inference ever overlaps for a session and the snapshot swap is atomic
//! from the matcher's point of view.
//!
//! Per-frame pipeline: detect → embed → match → liveness → dedup → record.
//! Identity is checked before liveness only to skip work when the face is
//! unknown; both predicates must hold for an event to be written. The
//! dedup authority is the ledger's unique `(identity, date)` constraint —
//! the prior `has_record_on` read is an early exit, not the guard.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use presence_core::{
    detector::crop_face, CosineMatcher, Detection, FaceDetector, FeatureExtractor,
    GallerySnapshot, LivenessConfig, LivenessScorer, SpoofModel,
};

use crate::ledger::{AttendanceLedger, LedgerError};
use crate::store::{GalleryStore, StoreError};

/// Builds one anti-spoof model instance per tracking session.
pub type SpoofModelFactory = Box<dyn Fn() -> Box<dyn SpoofModel> + Send>;

/// Upper bound on concurrently tracked liveness sessions. A caller that
/// never calls [`EngineHandle::end_session`] costs its stalest session its
/// state instead of growing the map without bound.
const MAX_SESSIONS: usize = 64;

#[derive(Error, Debug)]
pub enum DeciderError {
    #[error("gallery store unavailable: {0}")]
    GalleryUnavailable(#[source] StoreError),
    #[error("attendance ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),
    #[error("decision timed out")]
    Timeout,
    #[error("engine task exited")]
    ChannelClosed,
}

/// Why an attempt did not produce a new attendance event.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Detector found nothing in the frame.
    NoFaceDetected,
    /// The model produced no usable vector for the face crop.
    EmbeddingFailed,
    /// Best gallery score below the acceptance threshold.
    IdentityNotRecognized { best_similarity: f32 },
    /// Smoothed liveness score below the real threshold.
    LivenessRejected { smoothed_score: f32 },
    /// An event already exists for this identity today. Idempotent no-op,
    /// not an error.
    AlreadyRecorded,
}

/// Outcome of one attendance attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accepted { identity: String, similarity: f32 },
    Rejected(RejectReason),
}

/// Messages sent from callers to the engine task.
enum EngineRequest {
    Decide {
        session: String,
        frame: RgbImage,
        evidence_ref: Option<String>,
        reply: oneshot::Sender<Result<Decision, DeciderError>>,
    },
    RefreshGallery {
        reply: oneshot::Sender<Result<usize, DeciderError>>,
    },
    EndSession {
        session: String,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the full decision pipeline for one frame of a tracking session,
    /// bounded by `timeout`.
    ///
    /// A [`DeciderError::Timeout`] abandons the reply, not the work: the
    /// queued request still runs to completion on the engine task, so a
    /// timed-out attempt may have recorded attendance. Retrying is safe
    /// either way; the ledger's `(identity, date)` constraint absorbs the
    /// duplicate as [`RejectReason::AlreadyRecorded`].
    pub async fn decide(
        &self,
        session: &str,
        frame: RgbImage,
        evidence_ref: Option<String>,
        timeout: Duration,
    ) -> Result<Decision, DeciderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Decide {
                session: session.to_string(),
                frame,
                evidence_ref,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DeciderError::ChannelClosed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| DeciderError::ChannelClosed)?,
            Err(_) => Err(DeciderError::Timeout),
        }
    }

    /// Rebuild the gallery snapshot from the store and publish it as one
    /// reference swap. Returns the number of matchable entries.
    pub async fn refresh_gallery(&self) -> Result<usize, DeciderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::RefreshGallery { reply: reply_tx })
            .await
            .map_err(|_| DeciderError::ChannelClosed)?;
        reply_rx.await.map_err(|_| DeciderError::ChannelClosed)?
    }

    /// Drop the liveness state of a finished tracking session.
    pub async fn end_session(&self, session: &str) -> Result<(), DeciderError> {
        self.tx
            .send(EngineRequest::EndSession {
                session: session.to_string(),
            })
            .await
            .map_err(|_| DeciderError::ChannelClosed)
    }
}

struct SessionState {
    scorer: LivenessScorer,
    last_seen: Instant,
}

struct Engine {
    detector: Box<dyn FaceDetector>,
    extractor: FeatureExtractor,
    spoof_factory: Option<SpoofModelFactory>,
    store: GalleryStore,
    ledger: AttendanceLedger,
    snapshot: GallerySnapshot,
    sessions: HashMap<String, SessionState>,
    similarity_threshold: f32,
    liveness_config: LivenessConfig,
}

/// Spawn the decider engine task. The snapshot starts empty; call
/// [`EngineHandle::refresh_gallery`] once the store is populated.
pub fn spawn_engine(
    detector: Box<dyn FaceDetector>,
    extractor: FeatureExtractor,
    spoof_factory: Option<SpoofModelFactory>,
    store: GalleryStore,
    ledger: AttendanceLedger,
    similarity_threshold: f32,
    liveness_config: LivenessConfig,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let mut engine = Engine {
        detector,
        extractor,
        spoof_factory,
        store,
        ledger,
        snapshot: GallerySnapshot::empty(),
        sessions: HashMap::new(),
        similarity_threshold,
        liveness_config,
    };

    tokio::spawn(async move {
        tracing::info!("decider engine started");
        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::Decide {
                    session,
                    frame,
                    evidence_ref,
                    reply,
                } => {
                    let result = engine.decide(&session, &frame, evidence_ref.as_deref()).await;
                    let _ = reply.send(result);
                }
                EngineRequest::RefreshGallery { reply } => {
                    let _ = reply.send(engine.refresh_gallery().await);
                }
                EngineRequest::EndSession { session } => {
                    if engine.sessions.remove(&session).is_some() {
                        tracing::debug!(session, "liveness session ended");
                    }
                }
            }
        }
        tracing::info!("decider engine exiting");
    });

    EngineHandle { tx }
}

impl Engine {
    fn evict_stalest_session(&mut self) {
        let stalest = self
            .sessions
            .iter()
            .min_by_key(|(_, state)| state.last_seen)
            .map(|(id, _)| id.clone());
        if let Some(id) = stalest {
            self.sessions.remove(&id);
            tracing::warn!(session = id, "session cap reached, dropped stalest liveness state");
        }
    }

    async fn refresh_gallery(&mut self) -> Result<usize, DeciderError> {
        let entries = self
            .store
            .load_all()
            .await
            .map_err(DeciderError::GalleryUnavailable)?;
        // Built fully before the old snapshot is replaced — readers never
        // observe a half-updated gallery.
        let snapshot = GallerySnapshot::build(&entries);
        let count = snapshot.len();
        self.snapshot = snapshot;
        tracing::info!(entries = count, "gallery snapshot refreshed");
        Ok(count)
    }

    async fn decide(
        &mut self,
        session: &str,
        frame: &RgbImage,
        evidence_ref: Option<&str>,
    ) -> Result<Decision, DeciderError> {
        let detections = match self.detector.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                tracing::warn!(error = %err, session, "detector failed for frame");
                Vec::new()
            }
        };
        let best = best_detection(detections);

        // Every frame feeds the session's liveness state, including no-face
        // frames (sentinel samples keep the window's timing).
        if !self.sessions.contains_key(session) && self.sessions.len() >= MAX_SESSIONS {
            self.evict_stalest_session();
        }
        let config = &self.liveness_config;
        let spoof_factory = &self.spoof_factory;
        let state = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionState {
                scorer: LivenessScorer::new(
                    config.clone(),
                    spoof_factory.as_ref().map(|factory| factory()),
                ),
                last_seen: Instant::now(),
            });
        state.last_seen = Instant::now();
        let sample = state.scorer.observe(frame, best.as_ref());

        let Some(detection) = best else {
            return Ok(Decision::Rejected(RejectReason::NoFaceDetected));
        };
        let Some(crop) = crop_face(frame, &detection.bbox) else {
            tracing::warn!(session, "face box degenerate after clamping");
            return Ok(Decision::Rejected(RejectReason::NoFaceDetected));
        };

        let embedding = match self.extractor.extract(&crop) {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!(error = %err, session, "embedding extraction failed");
                return Ok(Decision::Rejected(RejectReason::EmbeddingFailed));
            }
        };

        let matched = match CosineMatcher.compare(&embedding, &self.snapshot, self.similarity_threshold)
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, session, "gallery comparison failed");
                return Ok(Decision::Rejected(RejectReason::EmbeddingFailed));
            }
        };
        let Some(identity) = matched.identity.filter(|_| matched.accepted) else {
            tracing::debug!(
                session,
                best_similarity = matched.similarity,
                "identity below threshold"
            );
            return Ok(Decision::Rejected(RejectReason::IdentityNotRecognized {
                best_similarity: matched.similarity,
            }));
        };

        if !sample.is_real {
            tracing::debug!(
                session,
                identity,
                smoothed = sample.smoothed_score,
                "liveness below threshold"
            );
            return Ok(Decision::Rejected(RejectReason::LivenessRejected {
                smoothed_score: sample.smoothed_score,
            }));
        }

        let now = chrono::Local::now().naive_local();
        let today = now.date();
        let already = self
            .ledger
            .has_record_on(&identity, today)
            .await
            .map_err(DeciderError::LedgerUnavailable)?;
        if already {
            return Ok(Decision::Rejected(RejectReason::AlreadyRecorded));
        }

        let inserted = self
            .ledger
            .record(&identity, today, now.time(), evidence_ref)
            .await
            .map_err(DeciderError::LedgerUnavailable)?;
        if !inserted {
            // Lost the race to a concurrent attempt; the constraint decided
            return Ok(Decision::Rejected(RejectReason::AlreadyRecorded));
        }

        tracing::info!(
            session,
            identity,
            similarity = matched.similarity,
            smoothed = sample.smoothed_score,
            "attendance recorded"
        );
        Ok(Decision::Accepted {
            identity,
            similarity: matched.similarity,
        })
    }
}

/// Highest-confidence detection wins; `None` when the frame has no face.
fn best_detection(detections: Vec<Detection>) -> Option<Detection> {
    detections.into_iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}
