//! Streaming liveness scoring: per-frame anti-spoof evidence fused with a
//! temporal motion signal, smoothed over a trailing window.
//!
//! A printed photograph or a replayed screen exhibits two tells a live face
//! does not: flat high-frequency texture (print rasters and display panels
//! smooth out skin micro-detail) and an unnatural motion profile (either
//! perfectly static landmarks or looped movement with no blink dynamics).
//! Each frame contributes one fused confidence sample to a bounded history;
//! the reported verdict is the mean of the most recent samples, so a single
//! noisy frame cannot flip the decision either way.
//!
//! # Threat coverage
//!
//! - **Blocks:** printed photographs, static screens, static masks.
//! - **Weakened against:** video replay with natural motion — which is why
//!   the anti-spoof term carries more fusion weight than the motion term.
//!
//! One scorer instance corresponds to one tracking session (one subject in
//! front of one camera). Sessions never share history state.

use image::RgbImage;

use crate::detector::{crop_face, Detection};
use crate::history::History;

/// Minimum landmark history before a non-zero motion score is produced.
/// Below this the scorer reports 0.0, biasing toward "not yet proven live".
const MIN_MOTION_SAMPLES: usize = 4;

/// Divisor squashing the nose-position standard deviation (pixels).
const HEAD_STD_SCALE: f32 = 8.0;

/// A nose–eye distance drop larger than this fraction of the mean distance
/// counts as a blink-like event.
const BLINK_DROP_RATIO: f32 = 0.06;

/// Tuning for one liveness session.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Fusion weight of the per-frame anti-spoof score.
    pub anti_spoof_weight: f32,
    /// Fusion weight of the temporal motion score. Kept below the
    /// anti-spoof weight: motion alone is replayable by a video loop.
    pub motion_weight: f32,
    /// Smoothed score at or above this is judged real.
    pub threshold_real: f32,
    /// Capacity of the nose / eye-midpoint position histories.
    pub landmark_history: usize,
    /// Capacity of the fused confidence history.
    pub confidence_history: usize,
    /// Trailing samples averaged into the reported smoothed score.
    pub smoothing_window: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            anti_spoof_weight: 0.65,
            motion_weight: 0.35,
            threshold_real: 0.63,
            landmark_history: 12,
            confidence_history: 150,
            smoothing_window: 4,
        }
    }
}

/// Dedicated anti-spoofing model (optional). Returns the raw logit for the
/// cropped face; the scorer applies the sigmoid and clamps to [0, 1].
pub trait SpoofModel: Send {
    fn infer(&mut self, face: &RgbImage) -> Result<f32, String>;
}

/// Per-frame liveness verdict. All scores are in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct LivenessSample {
    pub anti_spoof_score: f32,
    pub motion_score: f32,
    pub fused_score: f32,
    pub smoothed_score: f32,
    pub is_real: bool,
}

/// Streaming liveness scorer for one tracking session.
///
/// Feed every frame of the session through [`observe`](Self::observe) —
/// including frames with no detected face, which contribute sentinel
/// positions so the history window keeps its timing semantics.
pub struct LivenessScorer {
    config: LivenessConfig,
    spoof_model: Option<Box<dyn SpoofModel>>,
    nose_history: History<(f32, f32)>,
    eye_history: History<(f32, f32)>,
    confidence: History<f32>,
}

impl LivenessScorer {
    pub fn new(config: LivenessConfig, spoof_model: Option<Box<dyn SpoofModel>>) -> Self {
        let nose_history = History::new(config.landmark_history);
        let eye_history = History::new(config.landmark_history);
        let confidence = History::new(config.confidence_history);
        Self {
            config,
            spoof_model,
            nose_history,
            eye_history,
            confidence,
        }
    }

    /// Score one frame and fold it into the session state.
    pub fn observe(&mut self, frame: &RgbImage, detection: Option<&Detection>) -> LivenessSample {
        let anti_spoof_score = match detection {
            Some(det) => {
                match &det.landmarks {
                    Some(lm) => {
                        self.nose_history.push(lm.nose);
                        self.eye_history.push(lm.eye_midpoint());
                    }
                    // Box without landmarks: no motion evidence this frame
                    None => {
                        self.nose_history.push((0.0, 0.0));
                        self.eye_history.push((0.0, 0.0));
                    }
                }
                match crop_face(frame, &det.bbox) {
                    Some(crop) => self.anti_spoof_score(&crop),
                    None => 0.0,
                }
            }
            None => {
                // Sentinel keeps the window's timing without fabricating motion
                self.nose_history.push((0.0, 0.0));
                self.eye_history.push((0.0, 0.0));
                0.0
            }
        };

        let motion_score = self.motion_score();
        let fused_score = self.fuse(anti_spoof_score, motion_score);
        self.confidence.push(fused_score);

        let smoothed_score = self.smoothed();
        LivenessSample {
            anti_spoof_score,
            motion_score,
            fused_score,
            smoothed_score,
            is_real: smoothed_score >= self.config.threshold_real,
        }
    }

    /// Latest smoothed confidence: mean of the trailing window.
    pub fn smoothed(&self) -> f32 {
        let window = self.config.smoothing_window.max(1);
        let count = window.min(self.confidence.len());
        if count == 0 {
            return 0.0;
        }
        self.confidence.last(window).sum::<f32>() / count as f32
    }

    fn fuse(&self, anti_spoof: f32, motion: f32) -> f32 {
        (self.config.anti_spoof_weight * anti_spoof + self.config.motion_weight * motion)
            .clamp(0.0, 1.0)
    }

    fn anti_spoof_score(&mut self, crop: &RgbImage) -> f32 {
        if let Some(model) = self.spoof_model.as_mut() {
            match model.infer(crop) {
                Ok(logit) => return sigmoid(logit).clamp(0.0, 1.0),
                Err(err) => {
                    tracing::warn!(error = %err, "spoof model failed; using texture fallback");
                }
            }
        }
        texture_score(crop)
    }

    /// Motion score = 0.7 · head-movement + 0.3 · blink, over the bounded
    /// landmark histories.
    fn motion_score(&self) -> f32 {
        let n = self.nose_history.len();
        if n < MIN_MOTION_SAMPLES {
            return 0.0;
        }

        let xs: Vec<f32> = self.nose_history.iter().map(|p| p.0).collect();
        let ys: Vec<f32> = self.nose_history.iter().map(|p| p.1).collect();
        let head = (((std_dev(&xs) + std_dev(&ys)) / 2.0) / HEAD_STD_SCALE).tanh();

        let distances: Vec<f32> = self
            .nose_history
            .iter()
            .zip(self.eye_history.iter())
            .map(|(nose, eye)| {
                let dx = nose.0 - eye.0;
                let dy = nose.1 - eye.1;
                (dx * dx + dy * dy).sqrt()
            })
            .collect();
        let mean_dist = distances.iter().sum::<f32>() / distances.len() as f32;

        let blink = if mean_dist > 0.0 {
            let drops = distances
                .windows(2)
                .filter(|pair| pair[0] - pair[1] > BLINK_DROP_RATIO * mean_dist)
                .count();
            (drops as f32 / distances.len() as f32).clamp(0.0, 1.0)
        } else {
            0.0
        };

        (0.7 * head + 0.3 * blink).clamp(0.0, 1.0)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / values.len() as f32;
    var.sqrt()
}

/// Texture-based anti-spoof fallback.
///
/// Printed photos and screens exhibit lower high-frequency texture
/// (Laplacian variance) and flatter color variance than live skin under
/// typical lighting.
fn texture_score(crop: &RgbImage) -> f32 {
    let lap = laplacian_variance(crop);
    let color = color_variance(crop);
    (0.6 * (lap / 80.0).tanh() + 0.4 * (4.0 * color).tanh()).clamp(0.0, 1.0)
}

/// Variance of the 4-neighbour Laplacian over the grayscale crop —
/// a sharpness proxy. Zero for crops smaller than 3×3.
fn laplacian_variance(crop: &RgbImage) -> f32 {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }

    let luma: Vec<f32> = crop
        .pixels()
        .map(|p| 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32)
        .collect();
    let at = |x: usize, y: usize| luma[y * w + x];

    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            responses.push(4.0 * at(x, y) - at(x - 1, y) - at(x + 1, y) - at(x, y - 1) - at(x, y + 1));
        }
    }

    let mean = responses.iter().sum::<f32>() / responses.len() as f32;
    responses.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / responses.len() as f32
}

/// Mean per-channel variance of the crop with pixel values scaled to [0, 1].
fn color_variance(crop: &RgbImage) -> f32 {
    let count = (crop.width() * crop.height()) as f32;
    if count == 0.0 {
        return 0.0;
    }

    let mut var_sum = 0.0f32;
    for channel in 0..3 {
        let values: Vec<f32> = crop.pixels().map(|p| p.0[channel] as f32 / 255.0).collect();
        let mean = values.iter().sum::<f32>() / count;
        var_sum += values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
    }
    var_sum / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{BoundingBox, Landmarks};

    fn detection_at(nose: (f32, f32)) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 8,
                y: 8,
                width: 32,
                height: 32,
            },
            landmarks: Some(Landmarks {
                left_eye: (nose.0 - 10.0, nose.1 - 20.0),
                right_eye: (nose.0 + 10.0, nose.1 - 20.0),
                nose,
            }),
            confidence: 0.99,
        }
    }

    fn flat_frame() -> RgbImage {
        RgbImage::from_pixel(64, 64, image::Rgb([128, 128, 128]))
    }

    /// High-frequency checkerboard: Laplacian and color variance both large.
    fn textured_frame() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        })
    }

    struct FixedLogit(f32);

    impl SpoofModel for FixedLogit {
        fn infer(&mut self, _face: &RgbImage) -> Result<f32, String> {
            Ok(self.0)
        }
    }

    struct BrokenModel;

    impl SpoofModel for BrokenModel {
        fn infer(&mut self, _face: &RgbImage) -> Result<f32, String> {
            Err("inference backend gone".to_string())
        }
    }

    #[test]
    fn motion_requires_four_samples() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let frame = textured_frame();
        for i in 0..3 {
            let sample = scorer.observe(&frame, Some(&detection_at((100.0 + i as f32, 80.0))));
            assert_eq!(sample.motion_score, 0.0);
        }
        // Fourth sample: history is long enough for a motion estimate
        let sample = scorer.observe(&frame, Some(&detection_at((110.0, 80.0))));
        assert!(sample.motion_score > 0.0);
    }

    #[test]
    fn static_sequence_is_rejected() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let frame = flat_frame();
        let det = detection_at((100.0, 80.0));

        let mut last = None;
        for _ in 0..20 {
            last = Some(scorer.observe(&frame, Some(&det)));
        }
        let sample = last.unwrap();
        // Flat texture and frozen landmarks: every term stays near zero
        assert!(sample.anti_spoof_score < 0.05);
        assert_eq!(sample.motion_score, 0.0);
        assert!(sample.smoothed_score < scorer.config.threshold_real);
        assert!(!sample.is_real);
    }

    #[test]
    fn moving_textured_subject_is_accepted() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let frame = textured_frame();

        let mut last = None;
        for i in 0..16 {
            // ±8 px nose oscillation: per-axis std 8 on x, 0 on y
            let dx = if i % 2 == 0 { 0.0 } else { 16.0 };
            last = Some(scorer.observe(&frame, Some(&detection_at((100.0 + dx, 80.0)))));
        }
        let sample = last.unwrap();
        assert!(sample.anti_spoof_score > 0.85);
        assert!(sample.motion_score > 0.2);
        assert!(sample.is_real, "smoothed = {}", sample.smoothed_score);
    }

    #[test]
    fn no_face_pushes_sentinel_and_scores_zero() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let frame = textured_frame();

        for _ in 0..10 {
            let sample = scorer.observe(&frame, None);
            assert_eq!(sample.anti_spoof_score, 0.0);
            assert!(!sample.is_real);
        }
        assert_eq!(scorer.nose_history.len(), 10);
        assert_eq!(scorer.eye_history.len(), 10);
    }

    #[test]
    fn spoof_model_output_is_sigmoid_clamped() {
        // logit ln(0.9/0.1) → sigmoid 0.9
        let mut scorer = LivenessScorer::new(
            LivenessConfig::default(),
            Some(Box::new(FixedLogit(2.197_224_6))),
        );
        let sample = scorer.observe(&flat_frame(), Some(&detection_at((100.0, 80.0))));
        assert!((sample.anti_spoof_score - 0.9).abs() < 1e-4);
    }

    #[test]
    fn broken_spoof_model_falls_back_to_texture() {
        let mut scorer =
            LivenessScorer::new(LivenessConfig::default(), Some(Box::new(BrokenModel)));
        let sample = scorer.observe(&textured_frame(), Some(&detection_at((100.0, 80.0))));
        // Checkerboard texture scores high through the fallback path
        assert!(sample.anti_spoof_score > 0.85);
    }

    #[test]
    fn fusion_weights_match_contract() {
        let scorer = LivenessScorer::new(LivenessConfig::default(), None);
        // anti_spoof 0.9, motion 0.8 → 0.65·0.9 + 0.35·0.8 = 0.865
        let fused = scorer.fuse(0.9, 0.8);
        assert!((fused - 0.865).abs() < 1e-6);
        assert!(fused >= scorer.config.threshold_real);
    }

    #[test]
    fn smoothed_is_mean_of_trailing_window() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        for v in [0.1, 0.2, 0.6, 0.8, 0.8, 0.8] {
            scorer.confidence.push(v);
        }
        // window 4 → mean(0.6, 0.8, 0.8, 0.8) = 0.75
        assert!((scorer.smoothed() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn histories_stay_bounded() {
        let config = LivenessConfig::default();
        let landmark_cap = config.landmark_history;
        let confidence_cap = config.confidence_history;
        let mut scorer = LivenessScorer::new(config, None);
        let frame = flat_frame();
        for i in 0..200 {
            let det = detection_at((100.0 + (i % 5) as f32, 80.0));
            scorer.observe(&frame, Some(&det));
        }
        assert_eq!(scorer.nose_history.len(), landmark_cap);
        assert_eq!(scorer.eye_history.len(), landmark_cap);
        assert_eq!(scorer.confidence.len(), confidence_cap);
    }

    #[test]
    fn texture_score_separates_flat_from_sharp() {
        let flat = texture_score(&flat_frame());
        let sharp = texture_score(&textured_frame());
        assert!(flat < 0.05);
        assert!(sharp > 0.85);
    }
}
