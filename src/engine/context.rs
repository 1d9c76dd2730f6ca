use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::local::{EngineInner, Outcome};
use super::{Activity, ActivityOptions, SagaPhase, Workflow, WorkflowOptions};
use crate::errors::{EngineError, WorkflowError};
use crate::store::{InstanceStatus, ReceivedSignal, StepKind, StepRecord, StepStatus};

/// Handle a workflow uses to reach the outside world. Every call that
/// produces a result consumes one history slot, so workflow code must issue
/// them in the same order on every run.
pub struct WorkflowContext {
    engine: Arc<EngineInner>,
    workflow_id: String,
    root_id: String,
    seq: AtomicU32,
}

impl WorkflowContext {
    pub(super) fn new(engine: Arc<EngineInner>, workflow_id: String, root_id: String) -> Self {
        Self {
            engine,
            workflow_id,
            root_id,
            seq: AtomicU32::new(0),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Queue this workflow runs on; children default to it.
    pub fn task_queue(&self) -> &str {
        self.engine.task_queue()
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn recorded_step(
        &self,
        seq: u32,
        kind: StepKind,
        name: &str,
    ) -> Result<Option<StepRecord>, WorkflowError> {
        let id = self.workflow_id.clone();
        let step = self
            .engine
            .store
            .call(move |db| db.get_step(&id, seq))
            .await
            .map_err(EngineError::Store)?;
        match step {
            Some(step) if step.kind != kind || step.name != name => {
                Err(WorkflowError::NonDeterministic {
                    seq,
                    recorded: step.name,
                    replayed: name.to_string(),
                })
            }
            other => Ok(other),
        }
    }

    async fn record(&self, step: StepRecord) -> Result<(), WorkflowError> {
        let id = self.workflow_id.clone();
        self.engine
            .store
            .call(move |db| db.record_step(&id, &step))
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }

    /// Run an activity, or return its recorded result when replaying.
    pub async fn execute_activity<A: Activity>(
        &self,
        input: A::Input,
        options: ActivityOptions,
    ) -> Result<A::Output, WorkflowError> {
        let seq = self.next_seq();
        if let Some(step) = self.recorded_step(seq, StepKind::Activity, A::NAME).await? {
            match (step.status, step.output) {
                (StepStatus::Completed, Some(output)) => {
                    debug!(workflow_id = %self.workflow_id, seq, activity = A::NAME, "Replayed activity result");
                    return Ok(serde_json::from_value(output)?);
                }
                // Output was not persisted; run it again.
                (StepStatus::Completed, None) => {}
                (StepStatus::Failed, _) => {
                    return Err(WorkflowError::ActivityFailed {
                        activity: A::NAME.to_string(),
                        attempts: step.attempts,
                        message: step.error.unwrap_or_default(),
                    });
                }
            }
        }

        let input = serde_json::to_value(&input)?;
        let result = self
            .engine
            .run_activity(A::NAME, &self.workflow_id, input, &options)
            .await;

        match result {
            Ok((output, attempts)) => {
                self.record(StepRecord {
                    seq,
                    kind: StepKind::Activity,
                    name: A::NAME.to_string(),
                    status: StepStatus::Completed,
                    output: options.persist_output.then(|| output.clone()),
                    error: None,
                    attempts,
                })
                .await?;
                Ok(serde_json::from_value(output)?)
            }
            Err((err, attempts)) => {
                self.record(StepRecord {
                    seq,
                    kind: StepKind::Activity,
                    name: A::NAME.to_string(),
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(err.message.clone()),
                    attempts,
                })
                .await?;
                Err(WorkflowError::ActivityFailed {
                    activity: A::NAME.to_string(),
                    attempts,
                    message: err.message,
                })
            }
        }
    }

    /// Run a child workflow to completion inline. The child's execution
    /// timeout, if any, bounds how long this call can take.
    pub async fn execute_child_workflow<W: Workflow>(
        &self,
        input: W::Input,
        options: WorkflowOptions,
    ) -> Result<W::Output, WorkflowError> {
        let seq = self.next_seq();
        let child_id = options.id.clone();

        if let Some(step) = self.recorded_step(seq, StepKind::Child, W::NAME).await? {
            return match step.status {
                StepStatus::Completed => Ok(serde_json::from_value(
                    step.output.unwrap_or(Value::Null),
                )?),
                StepStatus::Failed => {
                    let id = child_id.clone();
                    let child = self
                        .engine
                        .store
                        .call(move |db| db.get_instance(&id))
                        .await
                        .map_err(EngineError::Store)?;
                    if child.is_some_and(|c| c.status == InstanceStatus::TimedOut) {
                        Err(WorkflowError::ChildTimedOut {
                            workflow_id: child_id,
                        })
                    } else {
                        Err(WorkflowError::ChildFailed {
                            workflow_id: child_id,
                            message: step.error.unwrap_or_default(),
                        })
                    }
                }
            };
        }

        let input = serde_json::to_value(&input)?;
        let outcome = self
            .engine
            .run_child(W::NAME, &self.workflow_id, &self.root_id, input, options)
            .await?;

        let (status, output, error) = match &outcome {
            Outcome::Completed(v) => (StepStatus::Completed, Some(v.clone()), None),
            Outcome::Failed(msg) => (StepStatus::Failed, None, Some(msg.clone())),
            Outcome::TimedOut => (
                StepStatus::Failed,
                None,
                Some("execution timeout exceeded".to_string()),
            ),
        };
        self.record(StepRecord {
            seq,
            kind: StepKind::Child,
            name: W::NAME.to_string(),
            status,
            output,
            error,
            attempts: 1,
        })
        .await?;

        match outcome {
            Outcome::Completed(v) => Ok(serde_json::from_value(v)?),
            Outcome::Failed(message) => Err(WorkflowError::ChildFailed {
                workflow_id: child_id,
                message,
            }),
            Outcome::TimedOut => Err(WorkflowError::ChildTimedOut {
                workflow_id: child_id,
            }),
        }
    }

    /// Suspend until `predicate` holds over the signals received so far.
    /// Wakes on signal delivery; never polls.
    pub async fn wait_condition<F>(&self, predicate: F) -> Result<(), WorkflowError>
    where
        F: Fn(&SignalSet) -> bool + Send + Sync,
    {
        let live = self.engine.live_entry(&self.workflow_id);
        loop {
            let notified = live.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let id = self.workflow_id.clone();
            let signals = self
                .engine
                .store
                .call(move |db| db.signals_for(&id))
                .await
                .map_err(EngineError::Store)?;
            if predicate(&SignalSet { signals }) {
                return Ok(());
            }
            debug!(workflow_id = %self.workflow_id, "Waiting for signal");
            notified.await;
        }
    }

    /// Record a saga phase on the root instance. Returns false when the
    /// phase would not move the saga forward.
    pub async fn advance_phase<P: SagaPhase>(&self, phase: P) -> Result<bool, WorkflowError> {
        let root = self.root_id.clone();
        let name = phase.as_str();
        let rank = phase.rank();
        let advanced = self
            .engine
            .store
            .call(move |db| db.advance_phase(&root, name, rank))
            .await
            .map_err(EngineError::Store)?;
        if advanced {
            info!(workflow_id = %self.root_id, phase = name, "Saga phase advanced");
        }
        Ok(advanced)
    }
}

/// Signals received by a workflow, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    signals: Vec<ReceivedSignal>,
}

impl SignalSet {
    pub fn contains(&self, name: &str) -> bool {
        self.signals.iter().any(|s| s.name == name)
    }

    pub fn payloads<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Option<&'a Value>> + 'a {
        self.signals
            .iter()
            .filter(move |s| s.name == name)
            .map(|s| s.payload.as_ref())
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub workflow_id: String,
    pub activity: &'static str,
    pub attempt: u32,
}

/// Per-attempt handle given to an activity.
pub struct ActivityContext {
    info: ActivityInfo,
    heartbeat: watch::Sender<()>,
}

impl ActivityContext {
    pub(super) fn new(info: ActivityInfo, heartbeat: watch::Sender<()>) -> Self {
        Self { info, heartbeat }
    }

    /// Context for running an activity outside any workflow, e.g. from the
    /// CLI or a test. Heartbeats go nowhere.
    pub fn standalone(activity: &'static str) -> Self {
        let (heartbeat, _) = watch::channel(());
        Self {
            info: ActivityInfo {
                workflow_id: String::new(),
                activity,
                attempt: 1,
            },
            heartbeat,
        }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    /// Report liveness. Long-running activities with a heartbeat timeout
    /// must call this more often than the timeout.
    pub fn heartbeat(&self) {
        self.heartbeat.send_replace(());
    }

    /// Await `fut`, heartbeating every `every` until it resolves. For a
    /// single long call that cannot report progress itself.
    pub async fn heartbeat_while<F: Future>(&self, every: Duration, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => self.heartbeat(),
            }
        }
    }
}
