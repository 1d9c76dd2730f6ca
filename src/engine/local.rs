//! In-process, SQLite-backed implementation of the engine contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{error, info, warn};

use super::context::{ActivityContext, ActivityInfo, WorkflowContext};
use super::{Activity, ActivityOptions, RetryPolicy, Workflow, WorkflowClient, WorkflowOptions};
use crate::errors::{ActivityError, EngineError, WorkflowError};
use crate::store::{InstanceStatus, NewInstance, Store, WorkflowInstance};

const DEFAULT_MAX_CONCURRENT_ACTIVITIES: usize = 16;

/// Terminal result of one workflow instance.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed(Value),
    Failed(String),
    TimedOut,
}

/// Wake-up and completion channels of an instance driven by this process.
pub(crate) struct LiveInstance {
    pub(crate) notify: Notify,
    outcome: watch::Sender<Option<Outcome>>,
}

impl LiveInstance {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            notify: Notify::new(),
            outcome,
        }
    }
}

#[async_trait]
trait ErasedActivity: Send + Sync {
    async fn call(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

struct ActivityAdapter<A>(A);

#[async_trait]
impl<A: Activity> ErasedActivity for ActivityAdapter<A> {
    async fn call(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("Invalid input for {}: {}", A::NAME, e))
        })?;
        let output = self.0.run(ctx, input).await?;
        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("Invalid output from {}: {}", A::NAME, e))
        })
    }
}

#[async_trait]
trait ErasedWorkflow: Send + Sync {
    async fn call(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError>;
}

struct WorkflowAdapter<W>(W);

#[async_trait]
impl<W: Workflow> ErasedWorkflow for WorkflowAdapter<W> {
    async fn call(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let input: W::Input = serde_json::from_value(input)?;
        let output = self.0.run(ctx, input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

pub(crate) struct EngineInner {
    pub(crate) store: Store,
    task_queue: String,
    workflows: HashMap<&'static str, Arc<dyn ErasedWorkflow>>,
    activities: HashMap<&'static str, Arc<dyn ErasedActivity>>,
    live: DashMap<String, Arc<LiveInstance>>,
    activity_slots: Semaphore,
}

pub struct EngineBuilder {
    store: Store,
    task_queue: String,
    workflows: HashMap<&'static str, Arc<dyn ErasedWorkflow>>,
    activities: HashMap<&'static str, Arc<dyn ErasedActivity>>,
    max_concurrent_activities: usize,
}

impl EngineBuilder {
    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn workflow<W: Workflow>(mut self, workflow: W) -> Self {
        self.workflows
            .insert(W::NAME, Arc::new(WorkflowAdapter(workflow)));
        self
    }

    pub fn activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities
            .insert(A::NAME, Arc::new(ActivityAdapter(activity)));
        self
    }

    pub fn max_concurrent_activities(mut self, n: usize) -> Self {
        self.max_concurrent_activities = n.max(1);
        self
    }

    pub fn build(self) -> LocalEngine {
        LocalEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                task_queue: self.task_queue,
                workflows: self.workflows,
                activities: self.activities,
                live: DashMap::new(),
                activity_slots: Semaphore::new(self.max_concurrent_activities),
            }),
        }
    }
}

/// Engine that drives workflows as tokio tasks in this process, with all
/// durable state in the shared [`Store`].
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl LocalEngine {
    pub fn builder(store: Store) -> EngineBuilder {
        EngineBuilder {
            store,
            task_queue: super::DEFAULT_TASK_QUEUE.to_string(),
            workflows: HashMap::new(),
            activities: HashMap::new(),
            max_concurrent_activities: DEFAULT_MAX_CONCURRENT_ACTIVITIES,
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.inner.task_queue
    }

    /// Resume every root instance left running by a previous process.
    pub async fn recover(&self) -> Result<Vec<WorkflowHandle>, EngineError> {
        let instances = self
            .inner
            .store
            .call(|db| db.running_root_instances())
            .await
            .map_err(EngineError::Store)?;

        let mut resumed = Vec::new();
        for instance in instances {
            if !self.inner.workflows.contains_key(instance.workflow_type.as_str()) {
                warn!(
                    workflow_id = %instance.id,
                    workflow_type = %instance.workflow_type,
                    "Skipping recovery of unregistered workflow type"
                );
                continue;
            }
            info!(workflow_id = %instance.id, "Resuming workflow");
            let live = self.inner.live_entry(&instance.id);
            resumed.push(WorkflowHandle {
                id: instance.id.clone(),
                outcome: live.outcome.subscribe(),
            });
            EngineInner::spawn_root(&self.inner, instance);
        }
        Ok(resumed)
    }

    /// Persisted state of an instance, if it exists.
    pub async fn describe(&self, workflow_id: &str) -> Result<Option<WorkflowInstance>, EngineError> {
        let id = workflow_id.to_string();
        self.inner
            .store
            .call(move |db| db.get_instance(&id))
            .await
            .map_err(EngineError::Store)
    }

    /// Handle for an instance this process is driving.
    pub fn handle(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.inner.live.get(workflow_id).map(|live| WorkflowHandle {
            id: workflow_id.to_string(),
            outcome: live.outcome.subscribe(),
        })
    }

    /// Result of an instance, waiting if this process is still driving it.
    pub async fn result<T: DeserializeOwned>(&self, workflow_id: &str) -> Result<T, WorkflowError> {
        if let Some(handle) = self.handle(workflow_id) {
            return handle.result().await;
        }
        let instance = self
            .describe(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        match instance.status {
            InstanceStatus::Completed => Ok(serde_json::from_value(
                instance.result.unwrap_or(Value::Null),
            )?),
            InstanceStatus::Failed => Err(WorkflowError::Application(
                instance.error.unwrap_or_default(),
            )),
            InstanceStatus::TimedOut => Err(WorkflowError::TimedOut {
                workflow_id: instance.id,
            }),
            InstanceStatus::Running => Err(EngineError::Abandoned { id: instance.id }.into()),
        }
    }
}

#[async_trait]
impl WorkflowClient for LocalEngine {
    async fn start_workflow_raw(
        &self,
        workflow_type: &str,
        input: Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowHandle, EngineError> {
        if !self.inner.workflows.contains_key(workflow_type) {
            return Err(EngineError::UnknownWorkflow(workflow_type.to_string()));
        }
        if options.task_queue != self.inner.task_queue {
            return Err(EngineError::UnknownTaskQueue(options.task_queue));
        }

        let id = options.id.clone();
        let new = NewInstance {
            id: id.clone(),
            workflow_type: workflow_type.to_string(),
            task_queue: options.task_queue.clone(),
            input,
            parent_id: None,
            root_id: id.clone(),
            deadline: options.execution_timeout.and_then(deadline_after),
            retry_policy: options
                .retry_policy
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        };

        let stored = self
            .inner
            .store
            .call(move |db| {
                let inserted = db.insert_instance(&new)?;
                Ok((inserted, db.get_instance(&new.id)?))
            })
            .await
            .map_err(EngineError::Store)?;

        let instance = match stored {
            (_, None) => return Err(EngineError::WorkflowNotFound(id)),
            (true, Some(instance)) => instance,
            (false, Some(existing)) => {
                if !existing.status.is_running() {
                    return Err(EngineError::AlreadyCompleted(id));
                }
                if existing.workflow_type != workflow_type || existing.parent_id.is_some() {
                    return Err(EngineError::AlreadyRunning(id));
                }
                info!(workflow_id = %id, "Workflow already running; returning existing handle");
                let live = self.inner.live_entry(&id);
                return Ok(WorkflowHandle {
                    id,
                    outcome: live.outcome.subscribe(),
                });
            }
        };

        let live = self.inner.live_entry(&id);
        let handle = WorkflowHandle {
            id: id.clone(),
            outcome: live.outcome.subscribe(),
        };
        info!(workflow_id = %id, workflow_type, "Workflow started");
        EngineInner::spawn_root(&self.inner, instance);
        Ok(handle)
    }

    async fn signal(
        &self,
        workflow_id: &str,
        signal_name: &str,
        payload: Option<Value>,
    ) -> Result<(), EngineError> {
        let id = workflow_id.to_string();
        let name = signal_name.to_string();
        self.inner
            .store
            .call(move |db| match db.get_instance(&id)? {
                None => Ok(Err(EngineError::WorkflowNotFound(id))),
                Some(instance) if !instance.status.is_running() => {
                    Ok(Err(EngineError::WorkflowNotRunning(id)))
                }
                Some(_) => {
                    db.insert_signal(&id, &name, payload.as_ref())?;
                    Ok(Ok(()))
                }
            })
            .await
            .map_err(EngineError::Store)??;

        if let Some(live) = self.inner.live.get(workflow_id) {
            live.notify.notify_waiters();
        }
        info!(workflow_id, signal = signal_name, "Signal delivered");
        Ok(())
    }
}

fn deadline_after(timeout: Duration) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(timeout).ok()?;
    Utc::now().checked_add_signed(delta)
}

fn remaining_until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

impl EngineInner {
    pub(crate) fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub(crate) fn live_entry(&self, workflow_id: &str) -> Arc<LiveInstance> {
        self.live
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(LiveInstance::new()))
            .value()
            .clone()
    }

    fn spawn_root(this: &Arc<Self>, instance: WorkflowInstance) {
        let engine = this.clone();
        tokio::spawn(async move {
            let outcome = engine.drive(&instance).await;
            engine.finish(&instance.id, &outcome).await;
        });
    }

    /// Run an instance through its retry policy, bounded by its deadline.
    async fn drive(self: &Arc<Self>, instance: &WorkflowInstance) -> Outcome {
        let Some(workflow) = self.workflows.get(instance.workflow_type.as_str()).cloned() else {
            return Outcome::Failed(format!(
                "Workflow type '{}' is not registered",
                instance.workflow_type
            ));
        };
        let policy = match instance.retry_policy.clone().map(serde_json::from_value) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                warn!(workflow_id = %instance.id, error = %e, "Unreadable retry policy; running once");
                RetryPolicy::no_retry()
            }
            None => RetryPolicy::no_retry(),
        };

        let attempts = async {
            let mut attempt = 1u32;
            loop {
                let ctx = WorkflowContext::new(
                    self.clone(),
                    instance.id.clone(),
                    instance.root_id.clone(),
                );
                match workflow.call(ctx, instance.input.clone()).await {
                    Ok(value) => return Outcome::Completed(value),
                    Err(e) if policy.allows_attempt(attempt + 1) => {
                        let delay = policy.delay_after(attempt);
                        warn!(workflow_id = %instance.id, attempt, error = %e, ?delay, "Workflow attempt failed; retrying");
                        tokio::time::sleep(delay).await;
                        let id = instance.id.clone();
                        if let Err(e) = self.store.call(move |db| db.reset_history(&id)).await {
                            return Outcome::Failed(format!("{:#}", e));
                        }
                        attempt += 1;
                    }
                    Err(WorkflowError::TimedOut { .. }) => return Outcome::TimedOut,
                    Err(e) => return Outcome::Failed(e.to_string()),
                }
            }
        };

        match instance.deadline {
            Some(deadline) => {
                match tokio::time::timeout(remaining_until(deadline), attempts).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::TimedOut,
                }
            }
            None => attempts.await,
        }
    }

    /// Persist the terminal state and release anyone awaiting the result.
    async fn finish(&self, workflow_id: &str, outcome: &Outcome) {
        let id = workflow_id.to_string();
        let closing = outcome.clone();
        let persisted = self
            .store
            .call(move |db| {
                let (status, result, err) = match &closing {
                    Outcome::Completed(v) => (InstanceStatus::Completed, Some(v), None),
                    Outcome::Failed(msg) => (InstanceStatus::Failed, None, Some(msg.as_str())),
                    Outcome::TimedOut => (
                        InstanceStatus::TimedOut,
                        None,
                        Some("execution timeout exceeded"),
                    ),
                };
                db.close_instance(&id, status, result, err)?;
                db.fail_running_children(&id, "parent workflow closed")?;
                Ok(status)
            })
            .await;

        match persisted {
            Ok(status) => info!(workflow_id, status = status.as_str(), "Workflow closed"),
            Err(e) => error!(workflow_id, error = %e, "Failed to persist workflow result"),
        }

        if let Some((_, live)) = self.live.remove(workflow_id) {
            live.outcome.send_replace(Some(outcome.clone()));
        }
    }

    /// Create or resume a child instance and drive it to completion.
    pub(crate) async fn run_child(
        self: &Arc<Self>,
        workflow_type: &'static str,
        parent_id: &str,
        root_id: &str,
        input: Value,
        options: WorkflowOptions,
    ) -> Result<Outcome, EngineError> {
        if options.task_queue != self.task_queue {
            return Err(EngineError::UnknownTaskQueue(options.task_queue));
        }
        if !self.workflows.contains_key(workflow_type) {
            return Err(EngineError::UnknownWorkflow(workflow_type.to_string()));
        }

        let new = NewInstance {
            id: options.id.clone(),
            workflow_type: workflow_type.to_string(),
            task_queue: options.task_queue.clone(),
            input,
            parent_id: Some(parent_id.to_string()),
            root_id: root_id.to_string(),
            deadline: options.execution_timeout.and_then(deadline_after),
            retry_policy: options
                .retry_policy
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        };
        let child_id = options.id;
        let instance = self
            .store
            .call(move |db| {
                db.insert_instance(&new)?;
                db.get_instance(&new.id)
            })
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::WorkflowNotFound(child_id.clone()))?;

        if instance.parent_id.as_deref() != Some(parent_id) {
            return Err(EngineError::AlreadyRunning(child_id));
        }

        match instance.status {
            InstanceStatus::Running => {}
            // Finished before the parent recorded it.
            InstanceStatus::Completed => {
                return Ok(Outcome::Completed(instance.result.unwrap_or(Value::Null)));
            }
            InstanceStatus::Failed => {
                return Ok(Outcome::Failed(instance.error.unwrap_or_default()));
            }
            InstanceStatus::TimedOut => return Ok(Outcome::TimedOut),
        }

        info!(workflow_id = %child_id, parent_id, workflow_type, "Child workflow started");
        self.live_entry(&child_id);
        let outcome = self.drive(&instance).await;
        self.finish(&child_id, &outcome).await;
        Ok(outcome)
    }

    /// Execute one activity step through its retry policy.
    /// Returns the output and the number of attempts made.
    pub(crate) async fn run_activity(
        &self,
        name: &'static str,
        workflow_id: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<(Value, u32), (ActivityError, u32)> {
        let Some(activity) = self.activities.get(name).cloned() else {
            return Err((
                ActivityError::non_retryable(EngineError::UnknownActivity(name.to_string()).to_string()),
                0,
            ));
        };
        let policy = options.retry_policy.clone().unwrap_or_default();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match self.activity_slots.acquire().await {
                Ok(_permit) => {
                    let info = ActivityInfo {
                        workflow_id: workflow_id.to_string(),
                        activity: name,
                        attempt,
                    };
                    run_attempt(activity.as_ref(), info, input.clone(), options).await
                }
                Err(_) => Err(ActivityError::non_retryable("Activity slots closed")),
            };

            match result {
                Ok(output) => return Ok((output, attempt)),
                Err(e) if e.retryable && policy.allows_attempt(attempt + 1) => {
                    let delay = policy.delay_after(attempt);
                    warn!(workflow_id, activity = name, attempt, error = %e, ?delay, "Activity attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(workflow_id, activity = name, attempt, error = %e, "Activity failed");
                    return Err((e, attempt));
                }
            }
        }
    }
}

async fn run_attempt(
    activity: &dyn ErasedActivity,
    info: ActivityInfo,
    input: Value,
    options: &ActivityOptions,
) -> Result<Value, ActivityError> {
    let (heartbeat_tx, heartbeat_rx) = watch::channel(());
    let ctx = ActivityContext::new(info, heartbeat_tx);
    let timeout = options.start_to_close_timeout;
    let work = tokio::time::timeout(timeout, activity.call(ctx, input));

    tokio::select! {
        result = work => match result {
            Ok(result) => result,
            Err(_) => Err(ActivityError::retryable(format!(
                "Activity exceeded start-to-close timeout of {:?}",
                timeout
            ))),
        },
        () = heartbeat_watchdog(heartbeat_rx, options.heartbeat_timeout) => {
            Err(ActivityError::retryable(format!(
                "Activity missed heartbeat timeout of {:?}",
                options.heartbeat_timeout.unwrap_or_default()
            )))
        }
    }
}

/// Resolves when no heartbeat arrives within `timeout`. Never resolves
/// when there is no timeout or the activity has finished.
async fn heartbeat_watchdog(mut beats: watch::Receiver<()>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        match tokio::time::timeout(timeout, beats.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return std::future::pending().await,
            Err(_) => return,
        }
    }
}

/// Awaitable result of a workflow instance.
pub struct WorkflowHandle {
    id: String,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle").field("id", &self.id).finish()
    }
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn result<T: DeserializeOwned>(mut self) -> Result<T, WorkflowError> {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Outcome::Completed(value)) => Ok(serde_json::from_value(value)?),
            Some(Outcome::Failed(message)) => Err(WorkflowError::Application(message)),
            Some(Outcome::TimedOut) => Err(WorkflowError::TimedOut { workflow_id: self.id }),
            None => Err(EngineError::Abandoned { id: self.id }.into()),
        }
    }
}
