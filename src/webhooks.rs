//! Turns verified webhook events into durable workflows.
//!
//! Each delivery maps to a workflow id derived from the event itself, so a
//! redelivered event finds its workflow already running or finished and is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spaghettihub_common::{
    CiPackage, PushEvent, RunnerSagaId, WorkflowAction, WorkflowJob, WorkflowJobEvent,
};
use tracing::{debug, info, warn};

use crate::commit_tracker::CommitTracker;
use crate::engine::{
    Activity, ActivityContext, ActivityOptions, RetryPolicy, Workflow, WorkflowClient,
    WorkflowClientExt, WorkflowContext, WorkflowOptions,
};
use crate::errors::{ActivityError, EngineError, WorkflowError};
use crate::ingress::WebhookEvent;
use crate::runner::{COMPLETED_SIGNAL, RunnerRequest, RunnerSagaWorkflow};

/// One field-wise commit update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum CommitUpdate {
    Push(PushEvent),
    JobStatus(WorkflowJobEvent),
}

pub struct UpdateCommitMetadata {
    tracker: CommitTracker,
}

impl UpdateCommitMetadata {
    pub fn new(tracker: CommitTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Activity for UpdateCommitMetadata {
    const NAME: &'static str = "update-commit-metadata";
    type Input = CommitUpdate;
    type Output = ();

    async fn run(&self, _ctx: ActivityContext, update: CommitUpdate) -> Result<(), ActivityError> {
        let outcome = match &update {
            CommitUpdate::Push(event) => self.tracker.record_push(event).await?,
            CommitUpdate::JobStatus(event) => self.tracker.record_job_status(event).await?,
        };
        debug!(?outcome, "Commit update applied");
        Ok(())
    }
}

pub struct CommitMetadataWorkflow;

#[async_trait]
impl Workflow for CommitMetadataWorkflow {
    const NAME: &'static str = "commit-metadata-workflow";
    type Input = CommitUpdate;
    type Output = ();

    async fn run(&self, ctx: WorkflowContext, update: CommitUpdate) -> Result<(), WorkflowError> {
        let options = ActivityOptions::new(Duration::from_secs(60)).with_retry_policy(
            RetryPolicy::bounded(10, Duration::from_secs(1), Duration::from_secs(60)),
        );
        ctx.execute_activity::<UpdateCommitMetadata>(update, options)
            .await
    }
}

/// What a delivery led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Started(String),
    /// The delivery's workflow already exists.
    Duplicate(String),
    Signaled(String),
    Ignored,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    engine: Arc<dyn WorkflowClient>,
    tracker: CommitTracker,
    task_queue: String,
}

impl WebhookDispatcher {
    pub fn new(engine: Arc<dyn WorkflowClient>, tracker: CommitTracker, task_queue: impl Into<String>) -> Self {
        Self {
            engine,
            tracker,
            task_queue: task_queue.into(),
        }
    }

    /// Queue the work for one event. Errors mean nothing could be queued.
    pub async fn dispatch(&self, event: WebhookEvent) -> Result<Vec<Dispatched>, EngineError> {
        match event {
            WebhookEvent::Push(push) => Ok(vec![self.dispatch_push(push).await?]),
            WebhookEvent::WorkflowJob(job) => self.dispatch_job(job).await,
        }
    }

    async fn dispatch_push(&self, push: PushEvent) -> Result<Dispatched, EngineError> {
        let mainline = format!("refs/heads/{}", self.tracker.settings().mainline_branch);
        let Some(sha) = push.head_commit.as_ref().map(|c| c.id.clone()) else {
            return Ok(Dispatched::Ignored);
        };
        if push.git_ref != mainline {
            debug!(git_ref = %push.git_ref, "Push outside the mainline branch");
            return Ok(Dispatched::Ignored);
        }
        self.start::<CommitMetadataWorkflow>(
            format!("commit-push-{}", sha),
            &CommitUpdate::Push(push),
        )
        .await
    }

    /// The runner start or signal is attempted even when queueing the status
    /// update fails; that failure is returned afterwards so the delivery is
    /// retried.
    async fn dispatch_job(&self, event: WorkflowJobEvent) -> Result<Vec<Dispatched>, EngineError> {
        let mut dispatched = Vec::new();
        let mut status_error = None;
        let job = &event.workflow_job;

        if self.reports_status(job) {
            let id = format!("commit-status-{}", job.id);
            match self
                .start::<CommitMetadataWorkflow>(id.clone(), &CommitUpdate::JobStatus(event.clone()))
                .await
            {
                Ok(outcome) => dispatched.push(outcome),
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "Could not queue commit status update");
                    status_error = Some(e);
                }
            }
        }

        if job.is_self_hosted() {
            match event.action {
                WorkflowAction::Queued => {
                    let request = RunnerRequest {
                        id: RunnerSagaId::new(job.id),
                        run_url: job.run_url.clone(),
                        labels: job.labels.clone(),
                    };
                    let outcome = self
                        .start::<RunnerSagaWorkflow>(request.id.outer_workflow_id(), &request)
                        .await?;
                    info!(run_id = job.id, labels = ?job.labels, "Runner requested");
                    dispatched.push(outcome);
                }
                WorkflowAction::Completed => dispatched.push(self.signal_completed(job).await),
                WorkflowAction::InProgress | WorkflowAction::Waiting => {}
            }
        }

        match status_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    /// Release pipeline jobs with a conclusion for a known package. Jobs
    /// without a conclusion must never clear a stored status.
    fn reports_status(&self, job: &WorkflowJob) -> bool {
        self.tracker.is_release_pipeline_job(job)
            && job.conclusion.is_some()
            && CiPackage::from_job_name(&job.name).is_some()
    }

    /// Fire-and-forget: failures are logged, never returned.
    async fn signal_completed(&self, job: &WorkflowJob) -> Dispatched {
        let Some(runner_name) = job.runner_name.as_deref() else {
            debug!(job_id = job.id, "Completed job has no runner name");
            return Dispatched::Ignored;
        };
        let id = match runner_name.parse::<RunnerSagaId>() {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Completed job ran on a runner this service does not own");
                return Dispatched::Ignored;
            }
        };
        let workflow_id = id.workflow_id();
        match self.engine.signal(&workflow_id, COMPLETED_SIGNAL, None).await {
            Ok(()) => {
                info!(workflow_id = %workflow_id, job_id = job.id, "Signaled runner completion");
                Dispatched::Signaled(workflow_id)
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Could not signal runner workflow");
                Dispatched::Ignored
            }
        }
    }

    async fn start<W: Workflow>(&self, id: String, input: &W::Input) -> Result<Dispatched, EngineError> {
        let options = WorkflowOptions::new(id.clone()).with_task_queue(self.task_queue.clone());
        match self.engine.start_workflow::<W>(input, options).await {
            Ok(handle) => {
                debug!(workflow_id = %handle.id(), workflow = W::NAME, "Workflow queued");
                Ok(Dispatched::Started(id))
            }
            Err(EngineError::AlreadyCompleted(_)) => {
                debug!(workflow_id = %id, "Duplicate delivery");
                Ok(Dispatched::Duplicate(id))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;
    use crate::commit_tracker::TrackerSettings;
    use crate::engine::{LocalEngine, WorkflowHandle};
    use crate::store::Store;

    /// Records calls; signals to unknown workflows fail like the engine's.
    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<(String, String)>>,
        signals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowClient for Recorder {
        async fn start_workflow_raw(
            &self,
            workflow_type: &str,
            _input: Value,
            options: WorkflowOptions,
        ) -> Result<WorkflowHandle, EngineError> {
            self.started
                .lock()
                .unwrap()
                .push((workflow_type.to_string(), options.id.clone()));
            Err(EngineError::AlreadyCompleted(options.id))
        }

        async fn signal(&self, workflow_id: &str, _: &str, _: Option<Value>) -> Result<(), EngineError> {
            self.signals.lock().unwrap().push(workflow_id.to_string());
            Err(EngineError::WorkflowNotFound(workflow_id.to_string()))
        }
    }

    /// Fails every commit-status start; everything else is recorded.
    #[derive(Default)]
    struct BrokenStatusStore {
        started: Mutex<Vec<String>>,
        signals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowClient for BrokenStatusStore {
        async fn start_workflow_raw(
            &self,
            _workflow_type: &str,
            _input: Value,
            options: WorkflowOptions,
        ) -> Result<WorkflowHandle, EngineError> {
            if options.id.starts_with("commit-status-") {
                return Err(EngineError::Store(anyhow::anyhow!("database is locked")));
            }
            self.started.lock().unwrap().push(options.id.clone());
            Err(EngineError::AlreadyCompleted(options.id))
        }

        async fn signal(&self, workflow_id: &str, _: &str, _: Option<Value>) -> Result<(), EngineError> {
            self.signals.lock().unwrap().push(workflow_id.to_string());
            Ok(())
        }
    }

    fn dispatcher(engine: Arc<dyn WorkflowClient>, store: Store) -> WebhookDispatcher {
        WebhookDispatcher::new(engine, CommitTracker::new(store, TrackerSettings::default()), "q")
    }

    fn job(action: &str, name: &str, labels: &[&str], runner: Option<&str>, conclusion: Option<&str>) -> WorkflowJobEvent {
        serde_json::from_value(json!({
            "action": action,
            "workflow_job": {
                "id": 77,
                "name": name,
                "workflow_name": "Continuous delivery pipeline",
                "head_branch": "master",
                "head_sha": "abc123",
                "conclusion": conclusion,
                "run_url": "https://api.github.com/repos/o/r/actions/runs/1",
                "labels": labels,
                "runner_name": runner
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_queued_self_hosted_starts_runner_saga() {
        let engine = Arc::new(Recorder::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        d.dispatch(WebhookEvent::WorkflowJob(job("queued", "build", &["self-hosted"], None, None)))
            .await
            .unwrap();
        assert_eq!(
            *engine.started.lock().unwrap(),
            vec![("github-runner-workflow".to_string(), "github-runner-77".to_string())]
        );
    }

    #[tokio::test]
    async fn test_status_failure_still_signals_self_hosted_completion() {
        let engine = Arc::new(BrokenStatusStore::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        let result = d
            .dispatch(WebhookEvent::WorkflowJob(job(
                "completed",
                "deb",
                &["self-hosted"],
                Some("internal-runner-77"),
                Some("success"),
            )))
            .await;
        assert!(matches!(result, Err(EngineError::Store(_))));
        assert_eq!(*engine.signals.lock().unwrap(), vec!["internal-runner-77"]);
    }

    #[tokio::test]
    async fn test_status_failure_still_starts_runner_saga() {
        let engine = Arc::new(BrokenStatusStore::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        let event = job("queued", "snap", &["self-hosted"], None, Some("success"));
        let result = d.dispatch(WebhookEvent::WorkflowJob(event)).await;
        assert!(result.is_err());
        assert_eq!(*engine.started.lock().unwrap(), vec!["github-runner-77"]);
    }

    #[tokio::test]
    async fn test_hosted_jobs_do_not_start_runners() {
        let engine = Arc::new(Recorder::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        let out = d
            .dispatch(WebhookEvent::WorkflowJob(job("queued", "build", &["ubuntu-latest"], None, None)))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(engine.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_signal_failure_is_swallowed() {
        let engine = Arc::new(Recorder::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        let out = d
            .dispatch(WebhookEvent::WorkflowJob(job(
                "completed",
                "build",
                &["self-hosted"],
                Some("internal-runner-77"),
                Some("success"),
            )))
            .await
            .unwrap();
        assert_eq!(out, vec![Dispatched::Ignored]);
        assert_eq!(*engine.signals.lock().unwrap(), vec!["internal-runner-77"]);
    }

    #[tokio::test]
    async fn test_foreign_runner_name_is_not_signaled() {
        let engine = Arc::new(Recorder::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        d.dispatch(WebhookEvent::WorkflowJob(job(
            "completed",
            "build",
            &["self-hosted"],
            Some("GitHub Actions 12"),
            Some("success"),
        )))
        .await
        .unwrap();
        assert!(engine.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_without_conclusion_is_not_queued() {
        let engine = Arc::new(Recorder::default());
        let d = dispatcher(engine.clone(), Store::open_in_memory().unwrap());
        d.dispatch(WebhookEvent::WorkflowJob(job("in_progress", "deb", &[], None, None)))
            .await
            .unwrap();
        assert!(engine.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_job_status_reaches_the_store() {
        let store = Store::open_in_memory().unwrap();
        let tracker = CommitTracker::new(store.clone(), TrackerSettings::default());
        let engine = LocalEngine::builder(store.clone())
            .task_queue("q")
            .workflow(CommitMetadataWorkflow)
            .activity(UpdateCommitMetadata::new(tracker.clone()))
            .build();
        let engine = Arc::new(engine);
        let d = WebhookDispatcher::new(engine.clone(), tracker, "q");

        let out = d
            .dispatch(WebhookEvent::WorkflowJob(job("completed", "snap", &[], None, Some("failure"))))
            .await
            .unwrap();
        assert_eq!(out, vec![Dispatched::Started("commit-status-77".into())]);
        engine.result::<()>("commit-status-77").await.unwrap();

        let commit = store.call(|db| db.get_commit("abc123")).await.unwrap().unwrap();
        assert_eq!(
            commit.continuous_delivery_test_snap_status,
            Some(spaghettihub_common::WorkflowConclusion::Failure)
        );
        assert!(commit.continuous_delivery_test_deb_status.is_none());

        let again = d
            .dispatch(WebhookEvent::WorkflowJob(job("completed", "snap", &[], None, Some("failure"))))
            .await
            .unwrap();
        assert_eq!(again, vec![Dispatched::Duplicate("commit-status-77".into())]);
    }
}
