use std::path::PathBuf;

use presence_core::LivenessConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file (gallery + attendance tables).
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive identity match.
    /// Single knob for the whole deployment — raise to trade false accepts
    /// for false rejects.
    pub similarity_threshold: f32,
    /// Timeout in seconds for one frame decision.
    pub decide_timeout_secs: u64,
    /// Smoothed liveness score at or above this is judged real.
    pub liveness_threshold: f32,
    /// Fusion weight of the per-frame anti-spoof score.
    pub anti_spoof_weight: f32,
    /// Fusion weight of the temporal motion score.
    pub motion_weight: f32,
    /// Capacity of the per-session landmark histories.
    pub landmark_history: usize,
    /// Capacity of the per-session fused confidence history.
    pub confidence_history: usize,
    /// Trailing samples averaged into the smoothed liveness score.
    pub smoothing_window: usize,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("presence.db"));

        let defaults = LivenessConfig::default();
        Self {
            db_path,
            similarity_threshold: env_f32("PRESENCE_SIMILARITY_THRESHOLD", 0.55),
            decide_timeout_secs: env_u64("PRESENCE_DECIDE_TIMEOUT_SECS", 10),
            liveness_threshold: env_f32("PRESENCE_LIVENESS_THRESHOLD", defaults.threshold_real),
            anti_spoof_weight: env_f32("PRESENCE_ANTI_SPOOF_WEIGHT", defaults.anti_spoof_weight),
            motion_weight: env_f32("PRESENCE_MOTION_WEIGHT", defaults.motion_weight),
            landmark_history: env_usize("PRESENCE_LANDMARK_HISTORY", defaults.landmark_history),
            confidence_history: env_usize(
                "PRESENCE_CONFIDENCE_HISTORY",
                defaults.confidence_history,
            ),
            smoothing_window: env_usize("PRESENCE_SMOOTHING_WINDOW", defaults.smoothing_window),
        }
    }

    /// Liveness tuning for one tracking session.
    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            anti_spoof_weight: self.anti_spoof_weight,
            motion_weight: self.motion_weight,
            threshold_real: self.liveness_threshold,
            landmark_history: self.landmark_history,
            confidence_history: self.confidence_history,
            smoothing_window: self.smoothing_window,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
