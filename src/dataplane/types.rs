//! Data plane error definitions and shared identifiers.

use thiserror::Error;

/// Errors that can occur while configuring the proxy.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Transport level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The store rejected a request.
    #[error("error calling {method} {path}: response was {status}: \"{body}\"")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// A request or response body could not be (de)serialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// The tracked version moved since the transaction was opened.
    #[error("version conflict: transaction opened at {expected}, client now at {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

impl DataplaneError {
    /// True if the store refused the request because of a stale version.
    ///
    /// A 409 is also returned for objects that already exist; only the
    /// ones naming the version count.
    pub fn is_version_conflict(&self) -> bool {
        match self {
            DataplaneError::VersionConflict { .. } => true,
            DataplaneError::Status { status: 409, body, .. } => {
                body.to_ascii_lowercase().contains("version")
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DataplaneError {
    fn from(e: serde_json::Error) -> Self {
        DataplaneError::Decode(e.to_string())
    }
}

/// Result type for data plane operations.
pub type DataplaneResult<T> = Result<T, DataplaneError>;

/// Kind of object owning a child object (log target, filter, rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentType {
    Frontend,
    Backend,
}

impl ParentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentType::Frontend => "frontend",
            ParentType::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ParentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataplaneError::Status {
            method: "PUT".to_string(),
            path: "/v1/services/haproxy/transactions/abc".to_string(),
            status: 409,
            body: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("409"));
        assert!(err.is_version_conflict());
    }

    #[test]
    fn test_conflict_detection() {
        let err = DataplaneError::VersionConflict {
            expected: 3,
            actual: 4,
        };
        assert!(err.is_version_conflict());
        assert!(!DataplaneError::Decode("x".into()).is_version_conflict());
    }

    #[test]
    fn test_existing_object_is_not_a_version_conflict() {
        let err = DataplaneError::Status {
            method: "PUT".to_string(),
            path: "/v1/services/haproxy/transactions/abc".to_string(),
            status: 409,
            body: "frontends front_upstream_cache already exists".to_string(),
        };
        assert!(!err.is_version_conflict());

        let err = DataplaneError::Status {
            method: "POST".to_string(),
            path: "/v1/services/haproxy/transactions?version=3".to_string(),
            status: 409,
            body: r#"{"code":409,"message":"Version in configuration file is 4, given version is 3"}"#.to_string(),
        };
        assert!(err.is_version_conflict());
    }
}
