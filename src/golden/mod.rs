//! The golden record: an append-only, HMAC-signed event log per run.
//!
//! Every semantic event of a run — start, each step, end — appends one
//! canonical JSON line to the run's record. When the run terminates the
//! record is signed with HMAC-SHA-256 under a process-scoped secret;
//! `verify` recomputes the MAC over the raw bytes, so any flipped or
//! appended byte is detected.
//!
//! Timestamps appear on disk (the `ts` field) but are excluded from
//! replay comparison; the file signature deliberately covers them,
//! because it authenticates bytes, not semantics. A step's
//! `retries_used` never appears in golden events at all.

pub mod compare;
pub mod recorder;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::RunStatus;

pub use compare::{CompareOptions, CompareReport, EventDiff, compare_events};
pub use recorder::{FileGoldenRecorder, MemoryGoldenRecorder, SigningSecret};

/// One semantic event in a run's golden record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GoldenEvent {
    RunStart {
        run_id: String,
        spec_id: String,
        seed: u64,
        replay: bool,
    },
    Step {
        index: u64,
        step_id: String,
        seed: u64,
        output: Value,
    },
    RunEnd {
        status: RunStatus,
    },
}

/// Errors from recording, signing, and verification.
#[derive(Debug, Error, Diagnostic)]
pub enum GoldenError {
    #[error("no golden record for run `{run_id}`")]
    #[diagnostic(code(replayweave::golden::missing_record))]
    MissingRecord { run_id: String },

    #[error("no signature for run `{run_id}`")]
    #[diagnostic(
        code(replayweave::golden::missing_signature),
        help("Call `sign` after the run terminates, before verifying.")
    )]
    MissingSignature { run_id: String },

    /// The stored signature does not match the record bytes.
    #[error("golden record for run `{run_id}` failed verification")]
    #[diagnostic(
        code(replayweave::golden::tamper),
        help("The record or its signature was modified after signing.")
    )]
    Tamper { run_id: String },

    #[error("signing failed: {message}")]
    #[diagnostic(code(replayweave::golden::signing))]
    Signing { message: String },

    #[error(transparent)]
    #[diagnostic(code(replayweave::golden::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(replayweave::golden::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GoldenError>;

/// Append-only recorder for golden events.
///
/// Implementations must append exactly one canonical JSON line per
/// `record` call, in call order, and must write signatures through a
/// temp-file-plus-rename (or equivalent) so readers never observe a
/// signature that does not correspond to the data.
#[async_trait]
pub trait GoldenRecorder: Send + Sync {
    /// Append one event to the run's record.
    async fn record(&self, run_id: &str, event: GoldenEvent) -> Result<()>;

    /// Sign the record's current bytes; returns the hex MAC.
    async fn sign(&self, run_id: &str) -> Result<String>;

    /// Recompute the MAC and compare constant-time against the stored
    /// signature. Mismatch is [`GoldenError::Tamper`].
    async fn verify(&self, run_id: &str) -> Result<()>;

    /// Parsed events of the record, in append order.
    async fn events(&self, run_id: &str) -> Result<Vec<Value>>;

    async fn record_run_start(
        &self,
        run_id: &str,
        spec_id: &str,
        seed: u64,
        replay: bool,
    ) -> Result<()> {
        self.record(
            run_id,
            GoldenEvent::RunStart {
                run_id: run_id.to_string(),
                spec_id: spec_id.to_string(),
                seed,
                replay,
            },
        )
        .await
    }

    async fn record_step(
        &self,
        run_id: &str,
        index: u64,
        step_id: &str,
        seed: u64,
        output: Value,
    ) -> Result<()> {
        self.record(
            run_id,
            GoldenEvent::Step {
                index,
                step_id: step_id.to_string(),
                seed,
                output,
            },
        )
        .await
    }

    async fn record_run_end(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.record(run_id, GoldenEvent::RunEnd { status }).await
    }
}
