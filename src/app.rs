//! Wiring: which workflows and activities the engine serves, and the state
//! the HTTP layer shares.

use std::sync::Arc;

use crate::api::{AppState, SharedState};
use crate::clients::{GitHubApi, LaunchpadApi, VmHost};
use crate::commit_tracker::{CommitTracker, TrackerSettings};
use crate::config::AppConfig;
use crate::engine::LocalEngine;
use crate::ingress::WebhookVerifier;
use crate::porting::{
    CompleteRequest, CreatePullRequestBranch, OpenPullRequest, PortProposalWorkflow,
    PortingSagaSettings, PortingSagaWorkflow, PortingService, PullRequestSettings,
    RetrieveMergeProposal, SyncFork, Vcs,
};
use crate::runner::{
    DestroyRunner, GetRegistrationToken, ProvisionRunnerWorkflow, RunnerSagaSettings,
    RunnerSagaWorkflow, SpawnRunner, SpawnSettings,
};
use crate::store::Store;
use crate::webhooks::{CommitMetadataWorkflow, UpdateCommitMetadata, WebhookDispatcher};

/// External systems the activities drive.
#[derive(Clone)]
pub struct Services {
    pub github: Arc<dyn GitHubApi>,
    pub launchpad: Arc<dyn LaunchpadApi>,
    pub vm_host: Arc<dyn VmHost>,
    pub vcs: Arc<dyn Vcs>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub runner: RunnerSagaSettings,
    pub spawn: SpawnSettings,
    pub porting: PortingSagaSettings,
    pub pull_request: PullRequestSettings,
    pub tracker: TrackerSettings,
    pub max_concurrent_activities: usize,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            runner: config.runner_saga_settings(),
            spawn: config.spawn_settings(),
            porting: config.porting_saga_settings(),
            pull_request: config.pull_request_settings(),
            tracker: config.tracker_settings(),
            max_concurrent_activities: config.database.max_concurrent_activities,
        }
    }
}

/// Register every workflow and activity against one store.
pub fn build_engine(store: &Store, services: &Services, settings: &EngineSettings) -> LocalEngine {
    let tracker = CommitTracker::new(store.clone(), settings.tracker.clone());
    LocalEngine::builder(store.clone())
        .max_concurrent_activities(settings.max_concurrent_activities)
        // Commit metadata
        .workflow(CommitMetadataWorkflow)
        .activity(UpdateCommitMetadata::new(tracker))
        // Runner saga
        .workflow(RunnerSagaWorkflow::new(settings.runner.clone()))
        .workflow(ProvisionRunnerWorkflow::new(settings.runner.clone()))
        .activity(GetRegistrationToken::new(services.github.clone()))
        .activity(SpawnRunner::new(services.vm_host.clone(), settings.spawn.clone()))
        .activity(DestroyRunner::new(services.vm_host.clone()))
        // Porting saga
        .workflow(PortingSagaWorkflow::new(settings.porting.clone()))
        .workflow(PortProposalWorkflow::new(settings.porting.clone()))
        .activity(RetrieveMergeProposal::new(services.launchpad.clone()))
        .activity(SyncFork::new(services.vcs.clone()))
        .activity(CreatePullRequestBranch::new(services.vcs.clone()))
        .activity(OpenPullRequest::new(
            services.github.clone(),
            settings.pull_request.clone(),
        ))
        .activity(CompleteRequest::new(store.clone()))
        .build()
}

pub fn build_state(
    store: Store,
    engine: Arc<LocalEngine>,
    tracker: TrackerSettings,
    webhook_secret: &str,
) -> SharedState {
    let queue = engine.task_queue().to_string();
    let tracker = CommitTracker::new(store.clone(), tracker);
    Arc::new(AppState {
        store: store.clone(),
        engine: engine.clone(),
        verifier: WebhookVerifier::new(webhook_secret),
        dispatcher: WebhookDispatcher::new(engine.clone(), tracker, queue.clone()),
        porting: PortingService::new(store, engine, queue),
    })
}
