use serde::Serialize;
use thiserror::Error;

/// Coarse error classification used in diagnostics and probe results.
///
/// Kinds are deliberately not merged: a checker that errored is
/// distinguishable from one that found nothing, and a cancelled execution
/// is distinguishable from a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    Network,
    IntegrityFailed,
    AppRunning,
    ExecutorFailed,
    Unsupported,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {message}")]
    Network { message: String, retriable: bool },

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("app is running: {0}")]
    AppRunning(String),

    #[error("executor failed: {stderr_tail}")]
    ExecutorFailed { stderr_tail: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Network { .. } => ErrorKind::Network,
            EngineError::IntegrityFailed(_) => ErrorKind::IntegrityFailed,
            EngineError::AppRunning(_) => ErrorKind::AppRunning,
            EngineError::ExecutorFailed { .. } => ErrorKind::ExecutorFailed,
            EngineError::Unsupported(_) => ErrorKind::Unsupported,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for network errors worth one retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Network { retriable: true, .. })
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("database: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(e.to_string()),
            std::io::ErrorKind::NotFound => EngineError::NotFound(e.to_string()),
            _ => EngineError::Internal(format!("io: {e}")),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        // Connect/timeout failures are worth a retry; HTTP status errors are not.
        let retriable = e.is_timeout() || e.is_connect();
        EngineError::Network {
            message: e.to_string(),
            retriable,
        }
    }
}

impl From<plist::Error> for EngineError {
    fn from(e: plist::Error) -> Self {
        EngineError::Internal(format!("plist: {e}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("json: {e}"))
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        assert_eq!(
            EngineError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_ne!(
            EngineError::NotFound("x".into()).kind(),
            EngineError::Cancelled.kind()
        );
    }

    #[test]
    fn only_retriable_network_errors_retry() {
        let e = EngineError::Network {
            message: "timed out".into(),
            retriable: true,
        };
        assert!(e.is_retriable());
        let e = EngineError::Network {
            message: "404".into(),
            retriable: false,
        };
        assert!(!e.is_retriable());
        assert!(!EngineError::Cancelled.is_retriable());
    }
}
