//! Runtime configuration resolved once at startup.
//!
//! Environment variables are read through `dotenvy` a single time into
//! a [`RuntimeConfig`]; nothing re-reads the environment on a hot
//! path. The emergency stop in particular is *initialized* from
//! `WORKFLOW_EMERGENCY_STOP` and thereafter lives on the policy
//! enforcer's atomic, flipped through its hot-reload setter.

use std::path::PathBuf;
use std::time::Duration;

use crate::golden::{FileGoldenRecorder, SigningSecret};
use crate::jobs::DEFAULT_HEARTBEAT_TIMEOUT_SECS;
use crate::policy::{PolicyEnforcer, PolicyLimits};

/// Orchestrator-level settings.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Directory for `{run_id}.steps.jsonl` golden records.
    pub golden_dir: PathBuf,
    /// Process-scoped signing secret; `None` disables signing.
    pub signing_secret: Option<String>,
    /// Initial state of the emergency stop switch.
    pub emergency_stop: bool,
    /// Staleness threshold for worker heartbeats.
    pub heartbeat_timeout: Duration,
    /// Per-step estimated-cost ceiling.
    pub step_ceiling_minor: u64,
    /// Default deadline for cross-workflow replies.
    pub invoke_timeout: Duration,
    /// SQLite database file for the durable stores.
    pub sqlite_db_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            golden_dir: PathBuf::from("golden"),
            signing_secret: None,
            emergency_stop: false,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            step_ceiling_minor: u64::MAX,
            invoke_timeout: Duration::from_secs(30),
            sqlite_db_name: "replayweave.db".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Resolve configuration from the environment (and `.env`).
    ///
    /// Recognized variables:
    /// - `REPLAYWEAVE_GOLDEN_DIR`
    /// - `REPLAYWEAVE_SIGNING_SECRET`
    /// - `WORKFLOW_EMERGENCY_STOP` (`1`/`true` engages the stop)
    /// - `REPLAYWEAVE_HEARTBEAT_TIMEOUT_SECS`
    /// - `REPLAYWEAVE_STEP_CEILING_MINOR`
    /// - `REPLAYWEAVE_INVOKE_TIMEOUT_MS`
    /// - `SQLITE_DB_NAME`
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("REPLAYWEAVE_GOLDEN_DIR") {
            config.golden_dir = PathBuf::from(dir);
        }
        if let Ok(secret) = std::env::var("REPLAYWEAVE_SIGNING_SECRET") {
            if !secret.is_empty() {
                config.signing_secret = Some(secret);
            }
        }
        if let Ok(stop) = std::env::var("WORKFLOW_EMERGENCY_STOP") {
            config.emergency_stop = parse_bool(&stop);
        }
        if let Some(secs) = env_u64("REPLAYWEAVE_HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(ceiling) = env_u64("REPLAYWEAVE_STEP_CEILING_MINOR") {
            config.step_ceiling_minor = ceiling;
        }
        if let Some(ms) = env_u64("REPLAYWEAVE_INVOKE_TIMEOUT_MS") {
            config.invoke_timeout = Duration::from_millis(ms);
        }
        if let Ok(name) = std::env::var("SQLITE_DB_NAME") {
            if !name.is_empty() {
                config.sqlite_db_name = name;
            }
        }
        config
    }

    #[must_use]
    pub fn with_golden_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.golden_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// Policy enforcer initialized from this configuration.
    #[must_use]
    pub fn build_enforcer(&self) -> PolicyEnforcer {
        PolicyEnforcer::new(PolicyLimits {
            step_ceiling_minor: self.step_ceiling_minor,
        })
        .with_emergency_stop(self.emergency_stop)
    }

    /// Durable golden recorder rooted at the configured directory.
    /// Returns `None` when no signing secret is configured.
    #[must_use]
    pub fn build_recorder(&self) -> Option<FileGoldenRecorder> {
        self.signing_secret.as_ref().map(|secret| {
            FileGoldenRecorder::new(
                &self.golden_dir,
                SigningSecret::new(secret.as_bytes().to_vec()),
            )
        })
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" on "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert!(!config.emergency_stop);
    }
}
