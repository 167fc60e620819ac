//! Typed error hierarchy for the call-evaluation orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `CallError` — synchronous failures surfaced to the caller of
//!   `create_call` and the read paths
//! - `EvalError` — per-attempt evaluation failures, observable only through
//!   `evaluation_last_error` and the status fields

use thiserror::Error;

/// Errors surfaced synchronously by the orchestrator and read paths.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("User {user_id} not found")]
    UserNotFound { user_id: String },

    #[error("Call {id} not found")]
    CallNotFound { id: String },

    #[error("Sequencing failed: {0}")]
    Sequencing(#[source] anyhow::Error),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from a single evaluation attempt. These never propagate to the
/// caller that created the call; the job runner records them and decides
/// whether to retry.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Evaluation service error: {0}")]
    Service(String),

    #[error("Evaluation service returned an empty response")]
    EmptyResponse,

    #[error("Malformed evaluation response: {0}")]
    MalformedResponse(String),

    #[error("Report failed schema validation: {0}")]
    InvalidReport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_user_not_found_carries_id() {
        let err = CallError::UserNotFound {
            user_id: "u-42".to_string(),
        };
        match &err {
            CallError::UserNotFound { user_id } => assert_eq!(user_id, "u-42"),
            _ => panic!("Expected UserNotFound"),
        }
        assert!(err.to_string().contains("u-42"));
    }

    #[test]
    fn call_error_variants_are_distinct() {
        let user_err = CallError::UserNotFound {
            user_id: "x".into(),
        };
        let call_err = CallError::CallNotFound { id: "x".into() };
        assert!(matches!(user_err, CallError::UserNotFound { .. }));
        assert!(matches!(call_err, CallError::CallNotFound { .. }));
        assert!(!matches!(user_err, CallError::CallNotFound { .. }));
    }

    #[test]
    fn sequencing_error_preserves_source_message() {
        let err = CallError::Sequencing(anyhow::anyhow!("counter store unavailable"));
        assert!(err.to_string().contains("counter store unavailable"));
    }

    #[test]
    fn eval_error_messages_identify_the_failure() {
        assert!(
            EvalError::Service("timeout".into())
                .to_string()
                .contains("timeout")
        );
        assert!(
            EvalError::EmptyResponse
                .to_string()
                .contains("empty response")
        );
        assert!(
            EvalError::InvalidReport("score out of range".into())
                .to_string()
                .contains("score out of range")
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CallError::Validation("x".into()));
        assert_std_error(&EvalError::EmptyResponse);
    }
}
