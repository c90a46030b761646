#![forbid(unsafe_code)]

//! Error taxonomy shared by the orchestrators and the HTTP layer.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Failures the request handlers know how to answer.
///
/// Values are `Clone` because a single download job may be awaited by several
/// requests at once and each of them needs its own copy of the outcome.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{tool} is not installed on the server")]
    Configuration { tool: &'static str },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("failed to launch {tool}: {detail}")]
    Launch { tool: &'static str, detail: String },
    #[error("{tool} exited with {status}: {stderr}")]
    Exit {
        tool: &'static str,
        status: String,
        stderr: String,
    },
    #[error("{tool} timed out after {}s", timeout.as_secs())]
    TimedOut {
        tool: &'static str,
        timeout: Duration,
    },
    #[error("malformed output from {tool}: {detail}")]
    Malformed { tool: &'static str, detail: String },
    #[error("{} was not produced", path.display())]
    FileNotProduced { path: PathBuf },
    #[error("{context}: {detail}")]
    Io { context: String, detail: String },
}

impl UpstreamError {
    /// Stable label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch failed",
            Self::Exit { .. } => "non-zero exit",
            Self::TimedOut { .. } => "timed out",
            Self::Malformed { .. } => "malformed output",
            Self::FileNotProduced { .. } => "file not produced",
            Self::Io { .. } => "io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            detail: err.to_string(),
        }
    }
}
