//! Webhook ingress: authenticate GitHub deliveries and classify them into
//! typed events. Nothing here has side effects.

mod signature;

use std::fmt;

use spaghettihub_common::{PushEvent, WorkflowJobEvent};

use crate::errors::IngressError;

pub use signature::{SIGNATURE_HEADER, sign, verify_signature};

/// Which endpoint a delivery arrived on, and so which payload it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Push,
    WorkflowJob,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::WorkflowJob => "workflow_job",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Push(PushEvent),
    WorkflowJob(WorkflowJobEvent),
}

/// Parse an already verified body.
pub fn classify(kind: EventKind, body: &[u8]) -> Result<WebhookEvent, IngressError> {
    let malformed = |source| IngressError::MalformedPayload {
        kind: kind.as_str(),
        source,
    };
    match kind {
        EventKind::Push => serde_json::from_slice(body)
            .map(WebhookEvent::Push)
            .map_err(malformed),
        EventKind::WorkflowJob => serde_json::from_slice(body)
            .map(WebhookEvent::WorkflowJob)
            .map_err(malformed),
    }
}

/// Holds the shared webhook secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify the signature, then classify. Fails closed: the body is not
    /// even parsed when the signature is missing or wrong.
    pub fn accept(
        &self,
        kind: EventKind,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookEvent, IngressError> {
        verify_signature(&self.secret, body, signature)?;
        classify(kind, body)
    }
}

#[cfg(test)]
mod tests {
    use spaghettihub_common::WorkflowAction;

    use super::*;

    const SECRET: &str = "webhook-secret";

    fn job_body() -> Vec<u8> {
        serde_json::json!({
            "action": "completed",
            "workflow_job": {
                "id": 77,
                "run_id": 9001,
                "name": "deb",
                "workflow_name": "Continuous delivery pipeline",
                "head_branch": "master",
                "head_sha": "abc123",
                "conclusion": "success",
                "run_url": "https://api.github.com/repos/o/r/actions/runs/9001",
                "labels": ["self-hosted"],
                "runner_name": "internal-runner-77",
                "steps": []
            },
            "repository": {"full_name": "o/r"}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_accepts_signed_workflow_job() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = job_body();
        let sig = sign(SECRET.as_bytes(), &body).unwrap();
        let event = verifier
            .accept(EventKind::WorkflowJob, Some(&sig), &body)
            .unwrap();
        let WebhookEvent::WorkflowJob(event) = event else {
            panic!("expected workflow job");
        };
        assert_eq!(event.action, WorkflowAction::Completed);
        assert_eq!(event.workflow_job.runner_name.as_deref(), Some("internal-runner-77"));
        assert!(event.workflow_job.is_self_hosted());
    }

    #[test]
    fn test_unsigned_body_is_never_parsed() {
        let verifier = WebhookVerifier::new(SECRET);
        let err = verifier
            .accept(EventKind::Push, None, b"not json at all")
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_signed_garbage_is_malformed() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = br#"{"action":"exploded"}"#;
        let sig = sign(SECRET.as_bytes(), body).unwrap();
        let err = verifier
            .accept(EventKind::WorkflowJob, Some(&sig), body)
            .unwrap_err();
        assert!(!err.is_authentication());
        assert!(err.to_string().contains("workflow_job"));
    }

    #[test]
    fn test_classify_push() {
        let body = serde_json::json!({
            "ref": "refs/heads/master",
            "commits": [],
            "head_commit": {
                "id": "abc123",
                "message": "Fix things",
                "timestamp": "2024-05-01T10:00:00+02:00",
                "author": {"name": "Jane", "email": "jane@example.com", "username": "jane"}
            }
        })
        .to_string();
        let WebhookEvent::Push(push) = classify(EventKind::Push, body.as_bytes()).unwrap() else {
            panic!("expected push");
        };
        assert_eq!(push.git_ref, "refs/heads/master");
        assert_eq!(push.head_commit.unwrap().id, "abc123");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let out = format!("{:?}", WebhookVerifier::new(SECRET));
        assert!(!out.contains(SECRET));
    }
}
