use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("{service} rejected credentials: {reason}")]
    Auth {
        service: &'static str,
        reason: String,
    },
    #[error("{service} {operation} still rate limited after {attempts} attempts")]
    RateLimited {
        service: &'static str,
        operation: String,
        attempts: usize,
    },
    #[error("{service} {operation} transport failure: {reason}")]
    Transport {
        service: &'static str,
        operation: String,
        reason: String,
    },
    #[error("{service} {operation} returned error: {reason}")]
    Api {
        service: &'static str,
        operation: String,
        reason: String,
    },
    #[error("summarization failed: {0}")]
    Summarization(String),
    #[error("failed to write summary {path}: {reason}")]
    Write { path: String, reason: String },
}

impl DigestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Config,
            Self::Auth { .. } => FailureKind::Auth,
            Self::RateLimited { .. } => FailureKind::RateLimit,
            Self::Transport { .. } => FailureKind::Transport,
            Self::Api { .. } => FailureKind::Api,
            Self::Summarization(_) => FailureKind::Summarization,
            Self::Write { .. } => FailureKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Auth,
    RateLimit,
    Transport,
    Api,
    Summarization,
    Write,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Transport => "transport",
            Self::Api => "api",
            Self::Summarization => "summarization",
            Self::Write => "write",
            Self::Other => "other",
        }
    }

    /// Run-level kinds abort the whole run instead of a single channel.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Config | Self::Auth)
    }

    /// Find the first `DigestError` anywhere in an anyhow chain.
    pub fn classify(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<DigestError>())
            .map(DigestError::kind)
            .unwrap_or(Self::Other)
    }
}
