//! Evaluation service boundary.
//!
//! Abstraction over the external scorer for testability.
//! Real implementation: `HttpEvaluationService`. Test doubles implement
//! `EvaluationService` directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EvalError;
use crate::report::Report;

/// External collaborator that scores a call recording. Slow (seconds) and
/// fallible; the job runner owns the retry budget.
#[async_trait]
pub trait EvaluationService: Send + Sync {
    async fn evaluate(&self, url: &str, prior_context: Option<&str>)
    -> Result<Report, EvalError>;
}

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_report: Option<&'a str>,
}

/// The scoring backend wraps the model output in a `message` envelope.
#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    message: String,
}

/// HTTP adapter for the scoring backend. Posts the audio reference plus the
/// prior report (when chaining) and parses the returned report.
pub struct HttpEvaluationService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEvaluationService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EvaluationService for HttpEvaluationService {
    async fn evaluate(
        &self,
        url: &str,
        prior_context: Option<&str>,
    ) -> Result<Report, EvalError> {
        let request = EvaluateRequest {
            text: url,
            prior_report: prior_context,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EvalError::Service(format!("request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| EvalError::Service(format!("scoring backend error: {}", e)))?;
        let body = resp
            .text()
            .await
            .map_err(|e| EvalError::Service(format!("failed to read response body: {}", e)))?;
        parse_report(&body)
    }
}

/// Parse a scoring response into a `Report`.
///
/// Accepts either a bare report object or the backend's
/// `{"message": "<json>"}` envelope; the inner payload may be wrapped in a
/// markdown code fence.
pub fn parse_report(body: &str) -> Result<Report, EvalError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(EvalError::EmptyResponse);
    }

    if let Ok(report) = serde_json::from_str::<Report>(trimmed) {
        return Ok(report);
    }

    let envelope: MessageEnvelope = serde_json::from_str(trimmed)
        .map_err(|e| EvalError::MalformedResponse(format!("not a report or envelope: {}", e)))?;
    let inner = strip_code_fence(envelope.message.trim());
    if inner.is_empty() {
        return Err(EvalError::EmptyResponse);
    }
    serde_json::from_str(inner)
        .map_err(|e| EvalError::MalformedResponse(format!("envelope payload: {}", e)))
}

/// Remove a surrounding ``` fence (with optional language tag) if present.
fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::test_report;

    #[test]
    fn test_parse_bare_report() {
        let json = serde_json::to_string(&test_report(80)).unwrap();
        let report = parse_report(&json).unwrap();
        assert_eq!(report.overall_score, 80);
    }

    #[test]
    fn test_parse_message_envelope() {
        let inner = serde_json::to_string(&test_report(65)).unwrap();
        let body = serde_json::to_string(&serde_json::json!({ "message": inner })).unwrap();
        let report = parse_report(&body).unwrap();
        assert_eq!(report.overall_score, 65);
    }

    #[test]
    fn test_parse_fenced_envelope_payload() {
        let inner = serde_json::to_string(&test_report(70)).unwrap();
        let fenced = format!("```json\n{}\n```", inner);
        let body = serde_json::to_string(&serde_json::json!({ "message": fenced })).unwrap();
        let report = parse_report(&body).unwrap();
        assert_eq!(report.overall_score, 70);
    }

    #[test]
    fn test_empty_body_is_empty_response() {
        assert!(matches!(parse_report("  "), Err(EvalError::EmptyResponse)));
    }

    #[test]
    fn test_empty_envelope_payload_is_empty_response() {
        let body = r#"{"message": ""}"#;
        assert!(matches!(parse_report(body), Err(EvalError::EmptyResponse)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_report("not json at all"),
            Err(EvalError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_report(r#"{"message": "not a report"}"#),
            Err(EvalError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
