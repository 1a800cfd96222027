use std::path::PathBuf;
use std::time::Duration;

use vigil_core::{RolloverPolicy, UnknownPolicy};

use crate::worker::WorkerSettings;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite session database.
    pub db_path: PathBuf,
    /// JSON snapshot of known identities.
    pub gallery_path: PathBuf,
    /// JSON-lines recording that stands in for the camera.
    pub replay_path: PathBuf,
    /// Euclidean distance at or below which a face matches an identity.
    pub match_threshold: f32,
    /// Re-match an unchanged, fully known scene after this many seconds.
    pub recheck_interval_secs: u64,
    /// Seconds without a sighting before a roster entry is closed.
    pub inactivity_secs: u64,
    /// Minimum seconds between forwards of an unchanged box count.
    pub submit_interval_secs: u64,
    /// Capture loop period in milliseconds.
    pub tick_ms: u64,
    /// Seconds to wait for the worker thread at shutdown.
    pub stop_timeout_secs: u64,
    /// Reuse ids for unknown faces seen again.
    pub stable_unknowns: bool,
    /// Distance within which an unknown face counts as seen before.
    pub unknown_tolerance: f32,
    /// Close a session and open a new one when an identity returns after
    /// the inactivity window, instead of restarting the window in place.
    pub split_sessions: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| vigil_store::default_db_path());

        let data_dir = db_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            gallery_path: std::env::var("VIGIL_GALLERY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("gallery.json")),
            replay_path: std::env::var("VIGIL_REPLAY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("replay.jsonl")),
            db_path,
            match_threshold: match_threshold(env_f32(
                "VIGIL_MATCH_THRESHOLD",
                vigil_core::DEFAULT_MATCH_THRESHOLD,
            )),
            recheck_interval_secs: env_u64("VIGIL_RECHECK_INTERVAL_SECS", 3),
            inactivity_secs: env_u64("VIGIL_INACTIVITY_SECS", 120),
            submit_interval_secs: env_u64("VIGIL_SUBMIT_INTERVAL_SECS", 1),
            tick_ms: env_u64("VIGIL_TICK_MS", 100),
            stop_timeout_secs: env_u64("VIGIL_STOP_TIMEOUT_SECS", 5),
            stable_unknowns: env_flag("VIGIL_STABLE_UNKNOWNS", false),
            unknown_tolerance: env_f32("VIGIL_UNKNOWN_TOLERANCE", 0.5),
            split_sessions: env_flag("VIGIL_SPLIT_SESSIONS", false),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            recheck_interval: Duration::from_secs(self.recheck_interval_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            match_threshold: self.match_threshold,
            unknown_policy: self.unknown_policy(),
        }
    }

    pub fn unknown_policy(&self) -> UnknownPolicy {
        if self.stable_unknowns {
            UnknownPolicy::Stable {
                tolerance: self.unknown_tolerance,
            }
        } else {
            UnknownPolicy::FreshPerBatch
        }
    }

    pub fn rollover_policy(&self) -> RolloverPolicy {
        if self.split_sessions {
            RolloverPolicy::SplitSession
        } else {
            RolloverPolicy::ResetFirstSeen
        }
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn submit_interval(&self) -> Duration {
        Duration::from_secs(self.submit_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Thresholds outside `(0, MAX_MATCH_THRESHOLD]` fall back to the default.
fn match_threshold(value: f32) -> f32 {
    if value > 0.0 && value <= vigil_core::MAX_MATCH_THRESHOLD {
        value
    } else {
        tracing::warn!(
            value,
            default = vigil_core::DEFAULT_MATCH_THRESHOLD,
            "VIGIL_MATCH_THRESHOLD out of range; using default"
        );
        vigil_core::DEFAULT_MATCH_THRESHOLD
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

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}
