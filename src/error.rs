//! Sync error types and remote-failure classification.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure talking to the tracker.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The tracker asked us to slow down.
    #[error("Rate limited by tracker")]
    RateLimited {
        /// Seconds to wait, when the tracker sent a Retry-After hint.
        retry_after_secs: Option<u64>,
    },

    /// The tracker rejected the payload.
    #[error("Validation error (HTTP {status}): {message}")]
    Validation { status: u16, message: String },

    /// Optimistic-concurrency conflict that survived a refresh.
    #[error("Version conflict updating issue {issue_key}")]
    VersionConflict { issue_key: String },

    /// The remote issue behind a registered identity no longer exists.
    #[error("Issue {issue_key} is gone from the tracker")]
    EntityGone { issue_key: String },

    /// Two different issue keys were registered for the same identity.
    ///
    /// This means the dedup invariant has already been violated; it is
    /// fatal for the affected entity and must reach the operator.
    #[error("Identity conflict for {key}: registered {existing}, attempted {attempted}")]
    IdentityConflict {
        key: String,
        existing: String,
        attempted: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (override files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether the mutation executor may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::RateLimited { .. }
        )
    }
}

/// Classified failure kind carried in a [`crate::executor::MutationOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient network failure or 5xx response.
    TransientNetwork,
    /// 429 response.
    RateLimited,
    /// Non-retryable 4xx response.
    Validation,
    /// 409 that survived a single token refresh.
    VersionConflict,
    /// Update target deleted or otherwise gone.
    EntityGone,
    /// A differing issue key was already registered for the identity.
    IdentityConflict,
}

impl ErrorKind {
    /// Classify an HTTP status code, if it represents a failure.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(ErrorKind::RateLimited),
            409 => Some(ErrorKind::VersionConflict),
            500..=599 => Some(ErrorKind::TransientNetwork),
            _ => Some(ErrorKind::Validation),
        }
    }

    /// Whether the executor may retry this kind.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientNetwork | ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Validation => "validation",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::EntityGone => "entity_gone",
            ErrorKind::IdentityConflict => "identity_conflict",
        };
        write!(f, "{s}")
    }
}

/// Message phrases that indicate the update target no longer exists.
///
/// Best-effort fallback behind the structured `errorIdentifier` check;
/// the tracker does not always return a distinct identifier for
/// deleted work packages.
const GONE_PHRASES: &[&str] = &["not be found", "deleted", "does not exist"];

/// Detect a gone/deleted target from a tracker error body.
///
/// Inspects the structured `errorIdentifier` first and only then falls
/// back to matching known phrases in the human-readable `message`.
#[must_use]
pub fn is_gone_response(body: &Value) -> bool {
    let identifier = body
        .get("errorIdentifier")
        .and_then(Value::as_str)
        .unwrap_or("");
    if identifier.contains("NotFound") {
        return true;
    }
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    GONE_PHRASES.iter().any(|p| message.contains(p))
}

/// Extract the human-readable message from a tracker error body.
#[must_use]
pub fn error_message(body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map_or_else(|| body.to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_success_as_none() {
        assert_eq!(ErrorKind::from_status(200), None);
        assert_eq!(ErrorKind::from_status(201), None);
        assert_eq!(ErrorKind::from_status(204), None);
    }

    #[test]
    fn classifies_retryable_statuses() {
        assert_eq!(ErrorKind::from_status(429), Some(ErrorKind::RateLimited));
        assert_eq!(
            ErrorKind::from_status(500),
            Some(ErrorKind::TransientNetwork)
        );
        assert_eq!(
            ErrorKind::from_status(503),
            Some(ErrorKind::TransientNetwork)
        );
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::TransientNetwork.is_retryable());
    }

    #[test]
    fn classifies_client_errors_as_validation() {
        assert_eq!(ErrorKind::from_status(400), Some(ErrorKind::Validation));
        assert_eq!(ErrorKind::from_status(422), Some(ErrorKind::Validation));
        assert!(!ErrorKind::Validation.is_retryable());
    }

    #[test]
    fn conflict_is_not_retryable() {
        assert_eq!(
            ErrorKind::from_status(409),
            Some(ErrorKind::VersionConflict)
        );
        assert!(!ErrorKind::VersionConflict.is_retryable());
    }

    #[test]
    fn identity_conflict_is_terminal() {
        assert!(!ErrorKind::IdentityConflict.is_retryable());
        assert_eq!(ErrorKind::IdentityConflict.to_string(), "identity_conflict");
    }

    #[test]
    fn gone_via_error_identifier() {
        let body = json!({
            "errorIdentifier": "urn:openproject-org:api:v3:errors:NotFound",
            "message": "whatever"
        });
        assert!(is_gone_response(&body));
    }

    #[test]
    fn gone_via_message_phrase() {
        let body = json!({"message": "The requested resource could not be found."});
        assert!(is_gone_response(&body));
        let body = json!({"message": "Work package was deleted by an admin"});
        assert!(is_gone_response(&body));
    }

    #[test]
    fn validation_body_is_not_gone() {
        let body = json!({
            "errorIdentifier": "urn:openproject-org:api:v3:errors:PropertyConstraintViolation",
            "message": "Subject can't be blank."
        });
        assert!(!is_gone_response(&body));
    }
}
