//! Typed error hierarchy for SpaghettiHub.
//!
//! - `IngressError`: webhook authentication and classification failures
//! - `EngineError`: durable engine bookkeeping (start, signal, persistence)
//! - `WorkflowError`: failures surfacing inside a running workflow
//! - `ActivityError`: a single activity attempt failing
//! - `VmHostError`: virtualization host API failures
//! - `PortingError`: rejected porting requests

use thiserror::Error;

/// Errors from webhook verification and classification. None of these cause
/// any state change.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("x-hub-signature-256 header is missing")]
    MissingSignature,

    #[error("Request signatures didn't match")]
    SignatureMismatch,

    #[error("Malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl IngressError {
    /// Authentication failures as opposed to payload failures.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::MissingSignature | Self::SignatureMismatch)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow type '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("Activity type '{0}' is not registered")]
    UnknownActivity(String),

    #[error("Task queue '{0}' is not served by this engine")]
    UnknownTaskQueue(String),

    #[error("Workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("Workflow {0} is not running")]
    WorkflowNotRunning(String),

    #[error("Workflow {0} already ran to completion")]
    AlreadyCompleted(String),

    #[error("Workflow id {0} is in use by another running workflow")]
    AlreadyRunning(String),

    #[error("Workflow {id} was abandoned before producing a result")]
    Abandoned { id: String },

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Engine persistence error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors observed by workflow code. Anything a workflow returns without
/// handling fails the workflow instance.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Activity {activity} failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        activity: String,
        attempts: u32,
        message: String,
    },

    #[error("Child workflow {workflow_id} failed: {message}")]
    ChildFailed {
        workflow_id: String,
        message: String,
    },

    #[error("Child workflow {workflow_id} exceeded its execution timeout")]
    ChildTimedOut { workflow_id: String },

    #[error("Workflow {workflow_id} exceeded its execution timeout")]
    TimedOut { workflow_id: String },

    #[error("History mismatch at step {seq}: recorded {recorded}, replayed {replayed}")]
    NonDeterministic {
        seq: u32,
        recorded: String,
        replayed: String,
    },

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Application(String),
}

impl WorkflowError {
    /// True when the failure was an execution timeout rather than an error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ChildTimedOut { .. } | Self::TimedOut { .. })
    }
}

/// Failure of a single activity attempt.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// The retry policy is skipped; the step fails immediately.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", err))
    }
}

impl From<VmHostError> for ActivityError {
    fn from(err: VmHostError) -> Self {
        Self::retryable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum VmHostError {
    #[error("Instance {0} not found")]
    NotFound(String),

    #[error("Virtualization host returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Virtualization host operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Virtualization host request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum PortingError {
    #[error("Not a Launchpad merge proposal URL: {0}")]
    InvalidLaunchpadUrl(String),

    /// The record exists and was marked `FAILED`.
    #[error("Porting request {request_uuid} could not be started: {source}")]
    StartFailed {
        request_uuid: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_error_authentication_classification() {
        assert!(IngressError::MissingSignature.is_authentication());
        assert!(IngressError::SignatureMismatch.is_authentication());
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = IngressError::MalformedPayload {
            kind: "push",
            source: parse_err,
        };
        assert!(!err.is_authentication());
        assert!(err.to_string().contains("push"));
    }

    #[test]
    fn workflow_error_timeout_detection() {
        let err = WorkflowError::ChildTimedOut {
            workflow_id: "internal-runner-1".into(),
        };
        assert!(err.is_timeout());
        let err = WorkflowError::ActivityFailed {
            activity: "spawn-runner".into(),
            attempts: 3,
            message: "boom".into(),
        };
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn activity_error_from_anyhow_is_retryable_and_keeps_context() {
        let err: ActivityError = anyhow::anyhow!("root cause")
            .context("Failed to call GitHub")
            .into();
        assert!(err.retryable);
        assert!(err.message.contains("Failed to call GitHub"));
        assert!(err.message.contains("root cause"));
    }

    #[test]
    fn engine_error_converts_into_workflow_error() {
        let err: WorkflowError = EngineError::WorkflowNotFound("x".into()).into();
        assert!(matches!(
            err,
            WorkflowError::Engine(EngineError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IngressError::MissingSignature);
        assert_std_error(&EngineError::UnknownWorkflow("w".into()));
        assert_std_error(&ActivityError::retryable("x"));
        assert_std_error(&VmHostError::NotFound("runner-1".into()));
        assert_std_error(&PortingError::InvalidLaunchpadUrl("u".into()));
    }
}
