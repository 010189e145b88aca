use std::fmt;
use std::io;
use std::time::Duration;

use super::types::ProviderType;

/// One rejected candidate during provider selection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CandidateFailure {
    pub provider_type: ProviderType,
    pub reason: String,
}

impl CandidateFailure {
    pub fn new(provider_type: ProviderType, reason: impl Into<String>) -> Self {
        Self {
            provider_type,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider_type, self.reason)
    }
}

fn join_failures(reasons: &[CandidateFailure]) -> String {
    if reasons.is_empty() {
        return "no candidates registered".into();
    }
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from sandbox operations.
///
/// Command-level failures (non-zero exit, crash, timeout) are never
/// represented here; they come back as a normal `ExecResult`. Backends map
/// their internal errors into `Backend`, `Io` or `Serde`.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provider {provider} unavailable: {reason}")]
    Unavailable {
        provider: ProviderType,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(ProviderType),

    #[error("pool exhausted for {provider}: no free slot within {}ms", .waited.as_millis())]
    PoolExhausted {
        provider: ProviderType,
        waited: Duration,
    },

    #[error("no sandbox provider available ({})", join_failures(.reasons))]
    NoProviderAvailable { reasons: Vec<CandidateFailure> },

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    pub fn unavailable(provider: ProviderType, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Serde(err.to_string())
    }
}
