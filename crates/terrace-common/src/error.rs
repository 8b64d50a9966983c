//! Error types for the Terrace operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors keep the underlying kube error so callers can tell a
//! missing object or a stale write apart from a broken connection.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Terrace operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Execution unit rendering error
    #[error("render error for stage {stage}: {message}")]
    Render {
        /// Stage being rendered
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// The reconciliation cycle was cancelled (shutdown or timeout)
    #[error("reconciliation cancelled")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "pipeline", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a render error for a stage
    pub fn render(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Render {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the store reported the object does not exist (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when the store rejected a write made against a stale token (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Conflicts, throttling and connection failures are transient.
    /// Validation, serialization and render errors need a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Render { .. } => false,
            Error::Cancelled => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Render { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Build an API error with the given HTTP status code
#[cfg(any(test, feature = "testing"))]
pub fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: match code {
                404 => "NotFound",
                409 => "Conflict",
                _ => "Unknown",
            }
            .to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a stale resourceVersion surfaces as a conflict the caller can retry
    #[test]
    fn story_conflicts_are_transient() {
        let err = api_error(409);
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.is_retryable());
    }

    /// Story: a missing object is distinguishable from other failures
    #[test]
    fn story_not_found_is_distinguishable() {
        let err = api_error(404);
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(!api_error(422).is_retryable());
    }

    #[test]
    fn spec_errors_are_not_retryable() {
        assert!(!Error::validation("bad module source").is_retryable());
        assert!(!Error::render("plan", "missing image").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = Error::validation_for("my-bucket", "module is empty");
        assert_eq!(
            err.to_string(),
            "validation error for my-bucket: module is empty"
        );

        let err = Error::internal_with_context("pipeline", "no steps");
        assert_eq!(err.context(), Some("pipeline"));
        assert_eq!(err.to_string(), "internal error [pipeline]: no steps");
    }

    #[test]
    fn test_serde_json_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
