use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::RunnerKey;

/// Semantic error kinds surfaced by the scheduler, per the error table in the design
/// doc. The variant name IS the wire `code` (snake_case) returned to HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerErrorKind {
    ModelNotFound,
    BackendNotFound,
    UnsupportedFormat,
    ModeNotSupported,
    InstallFailed,
    StartupFailed,
    NotReady,
    UpstreamError,
    ClientDisconnected,
    ConfigInvalid,
}

impl SchedulerErrorKind {
    /// HTTP status this kind maps to, per spec.md §7 / §6's error column.
    pub fn http_status(self) -> u16 {
        match self {
            Self::ModelNotFound | Self::BackendNotFound => 404,
            Self::UnsupportedFormat | Self::ModeNotSupported | Self::ConfigInvalid => 400,
            Self::InstallFailed | Self::StartupFailed | Self::NotReady => 503,
            Self::UpstreamError => 502,
            Self::ClientDisconnected => 499,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerError {
    pub kind: SchedulerErrorKind,
    pub message: String,
    pub retryable: bool,
    pub backend_id: Option<String>,
    pub runner_key: Option<String>,
}

impl SchedulerError {
    pub fn new(kind: SchedulerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(kind, SchedulerErrorKind::UpstreamError | SchedulerErrorKind::NotReady),
            backend_id: None,
            runner_key: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_backend_id(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    pub fn with_runner_key(mut self, key: &RunnerKey) -> Self {
        self.runner_key = Some(key.fingerprint());
        self
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.backend_id, &self.runner_key) {
            (Some(backend_id), Some(runner_key)) => {
                write!(f, "{} (backend={backend_id}, runner={runner_key})", self.message)
            }
            (Some(backend_id), None) => write!(f, "{} (backend={backend_id})", self.message),
            (None, Some(runner_key)) => write!(f, "{} (runner={runner_key})", self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SchedulerError {}

pub fn model_not_found(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::ModelNotFound, message).with_retryable(false)
}

pub fn backend_not_found(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::BackendNotFound, message).with_retryable(false)
}

pub fn unsupported_format(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::UnsupportedFormat, message).with_retryable(false)
}

pub fn mode_not_supported(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::ModeNotSupported, message).with_retryable(false)
}

pub fn install_failed(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::InstallFailed, message).with_retryable(true)
}

pub fn startup_failed(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::StartupFailed, message).with_retryable(true)
}

pub fn not_ready(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::NotReady, message).with_retryable(true)
}

pub fn upstream_error(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::UpstreamError, message).with_retryable(true)
}

pub fn client_disconnected(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::ClientDisconnected, message).with_retryable(false)
}

pub fn config_invalid(message: impl Into<String>) -> SchedulerError {
    SchedulerError::new(SchedulerErrorKind::ConfigInvalid, message).with_retryable(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_defaults_follow_kind() {
        let err = SchedulerError::new(SchedulerErrorKind::UpstreamError, "boom");
        assert!(err.retryable);
        let err = SchedulerError::new(SchedulerErrorKind::ModelNotFound, "boom");
        assert!(!err.retryable);
    }

    #[test]
    fn http_status_matches_error_table() {
        assert_eq!(SchedulerErrorKind::ModelNotFound.http_status(), 404);
        assert_eq!(SchedulerErrorKind::UnsupportedFormat.http_status(), 400);
        assert_eq!(SchedulerErrorKind::InstallFailed.http_status(), 503);
        assert_eq!(SchedulerErrorKind::UpstreamError.http_status(), 502);
        assert_eq!(SchedulerErrorKind::ClientDisconnected.http_status(), 499);
    }

    #[test]
    fn display_includes_backend_and_runner_context() {
        let err = SchedulerError::new(SchedulerErrorKind::NotReady, "still starting")
            .with_backend_id("llama.cpp");
        assert_eq!(err.to_string(), "still starting (backend=llama.cpp)");
    }
}
