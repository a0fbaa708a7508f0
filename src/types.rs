//! Core types shared across the orchestrator.
//!
//! This module defines the failure taxonomy and the terminal run
//! statuses — the vocabulary every other module speaks. Component-local
//! error enums (store backends, the inbox, the sandbox) live next to
//! their components; what belongs here is the classification of *step*
//! failures that drives retry policy and error modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a skill-reported failure.
///
/// Retryability is a property of the kind: transient infrastructure
/// kinds retry with backoff, everything else fails the step at the
/// first occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillErrorKind {
    Transient,
    Permanent,
    Timeout,
    RateLimited,
    UpstreamUnavailable,
    Authn,
    Authz,
    MalformedResponse,
    Quota,
}

impl SkillErrorKind {
    /// Whether a failure of this kind is eligible for retry with backoff.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::RateLimited | Self::UpstreamUnavailable
        )
    }
}

impl fmt::Display for SkillErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Authn => "authn",
            Self::Authz => "authz",
            Self::MalformedResponse => "malformed_response",
            Self::Quota => "quota",
        };
        write!(f, "{s}")
    }
}

/// The failure kind recorded on a step result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An input reference did not resolve against predecessor outputs.
    Reference,
    /// Skill inputs or outputs violated the declared schema, or the
    /// skill itself is unknown to the registry.
    Schema,
    /// The skill reported a failure of the given kind.
    Skill(SkillErrorKind),
    /// A predecessor the step depends on failed and the referencing
    /// input is not declared null-tolerant.
    UpstreamFailed,
    /// The step's cross-workflow reply did not arrive in time.
    InboxTimeout,
    /// The run was cancelled before the step could complete.
    Cancelled,
}

impl ErrorKind {
    /// Only skill failures of a retryable kind re-enter the retry loop.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Skill(kind) if kind.is_retryable())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference_error"),
            Self::Schema => write!(f, "schema_error"),
            Self::Skill(kind) => write!(f, "skill_error:{kind}"),
            Self::UpstreamFailed => write!(f, "upstream_failed"),
            Self::InboxTimeout => write!(f, "inbox_timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal status of a workflow run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    BudgetExceeded,
    PolicyViolation,
    Cancelled,
}

impl RunStatus {
    /// Stable string form used in golden events and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::PolicyViolation => "policy_violation",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a cancelled run leaves behind in the checkpoint store.
///
/// `Pause` keeps the run resumable; `Terminate` marks it terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancelIntent {
    #[default]
    Pause,
    Terminate,
}
