#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spaghettihub::app::{EngineSettings, Services, build_engine};
use spaghettihub::clients::{
    GitHubApi, InstanceSpec, InstanceState, LaunchpadApi, MergeProposal, NewPullRequest,
    PullRequest, RegistrationToken, VmHost,
};
use spaghettihub::config::AppConfig;
use spaghettihub::engine::{LocalEngine, RetryPolicy};
use spaghettihub::errors::VmHostError;
use spaghettihub::porting::{MergeOutcome, Vcs};
use spaghettihub::store::Store;

pub const PROPOSAL_URL: &str = "https://code.launchpad.net/~jane/maas/+git/maas/+merge/451234";

#[derive(Default)]
pub struct FakeGitHub {
    pub fail_tokens: bool,
    pub tokens_issued: Mutex<u32>,
    pub pull_requests: Mutex<Vec<NewPullRequest>>,
}

#[async_trait]
impl GitHubApi for FakeGitHub {
    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken> {
        if self.fail_tokens {
            anyhow::bail!("GitHub returned 503");
        }
        *self.tokens_issued.lock().unwrap() += 1;
        Ok(RegistrationToken {
            token: "AABBCC".into(),
            expires_at: None,
        })
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> anyhow::Result<PullRequest> {
        let mut prs = self.pull_requests.lock().unwrap();
        prs.push(request.clone());
        Ok(PullRequest {
            number: prs.len() as i64,
            html_url: format!("https://github.com/canonical/maas/pull/{}", prs.len()),
        })
    }
}

#[derive(Default)]
pub struct FakeLaunchpad {
    pub fail: bool,
}

pub fn proposal() -> MergeProposal {
    MergeProposal {
        id: 451234,
        web_url: PROPOSAL_URL.into(),
        registrant: "jane".into(),
        source_branch: "fix-dhcp".into(),
        source_repository: "https://git.launchpad.net/~jane/maas".into(),
        description: None,
        commit_message: Some("Fix DHCP leases".into()),
        diff: "--- a/README\n+++ b/README\n@@ -1 +1 @@\n-old\n+new\n".into(),
    }
}

#[async_trait]
impl LaunchpadApi for FakeLaunchpad {
    async fn fetch_merge_proposal(&self, web_url: &str) -> anyhow::Result<MergeProposal> {
        if self.fail {
            anyhow::bail!("Launchpad returned error status for preview diff");
        }
        assert_eq!(web_url, PROPOSAL_URL);
        Ok(proposal())
    }
}

/// In-memory virtualization host recording every call.
#[derive(Default)]
pub struct FakeHost {
    pub states: Mutex<HashMap<String, InstanceState>>,
    pub created: Mutex<Vec<InstanceSpec>>,
    pub deletes: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn state(&self, name: &str) -> Option<InstanceState> {
        self.states.lock().unwrap().get(name).copied()
    }

    pub fn delete_count(&self, name: &str) -> usize {
        self.deletes.lock().unwrap().iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl VmHost for FakeHost {
    async fn instance_state(&self, name: &str) -> Result<InstanceState, VmHostError> {
        self.state(name)
            .ok_or_else(|| VmHostError::NotFound(name.to_string()))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), VmHostError> {
        self.created.lock().unwrap().push(spec.clone());
        self.states
            .lock()
            .unwrap()
            .insert(spec.name.clone(), InstanceState::Stopped);
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), VmHostError> {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), InstanceState::Running);
        Ok(())
    }

    async fn stop_instance(&self, name: &str, _force: bool) -> Result<(), VmHostError> {
        match self.states.lock().unwrap().get_mut(name) {
            Some(state) => {
                *state = InstanceState::Stopped;
                Ok(())
            }
            None => Err(VmHostError::NotFound(name.to_string())),
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), VmHostError> {
        self.deletes.lock().unwrap().push(name.to_string());
        self.states
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VmHostError::NotFound(name.to_string()))
    }
}

/// Records the order of VCS operations.
pub struct FakeVcs {
    pub merge_outcome: MergeOutcome,
    pub calls: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new(merge_outcome: MergeOutcome) -> Self {
        Self {
            merge_outcome,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn sync_fork(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("sync_fork".into());
        Ok(())
    }

    async fn merge_proposal(
        &self,
        branch: &str,
        _source_repository: &str,
        source_branch: &str,
    ) -> anyhow::Result<MergeOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("merge {} {}", branch, source_branch));
        Ok(self.merge_outcome)
    }

    async fn apply_patch(&self, branch: &str, _diff: &str, message: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("patch {} {}", branch, message));
        Ok(())
    }

    async fn push_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("push {}", branch));
        Ok(())
    }
}

pub struct Harness {
    pub store: Store,
    pub engine: Arc<LocalEngine>,
    pub settings: EngineSettings,
    pub github: Arc<FakeGitHub>,
    pub host: Arc<FakeHost>,
    pub vcs: Arc<FakeVcs>,
}

/// Settings with retry delays short enough for tests.
pub fn fast_settings() -> EngineSettings {
    let quick = RetryPolicy::bounded(2, Duration::from_millis(10), Duration::from_millis(10));
    let mut settings = EngineSettings::from_config(&AppConfig::default());
    settings.runner.token_retry = quick.clone();
    settings.runner.spawn_retry = quick.clone();
    settings.porting.retry = quick.clone();
    settings.porting.pull_request_retry = quick;
    settings
}

pub struct HarnessBuilder {
    settings: EngineSettings,
    github: FakeGitHub,
    launchpad: FakeLaunchpad,
    merge_outcome: MergeOutcome,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            settings: fast_settings(),
            github: FakeGitHub::default(),
            launchpad: FakeLaunchpad::default(),
            merge_outcome: MergeOutcome::Merged,
        }
    }

    pub fn settings(mut self, f: impl FnOnce(&mut EngineSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn failing_tokens(mut self) -> Self {
        self.github.fail_tokens = true;
        self
    }

    pub fn failing_launchpad(mut self) -> Self {
        self.launchpad.fail = true;
        self
    }

    pub fn merge_outcome(mut self, outcome: MergeOutcome) -> Self {
        self.merge_outcome = outcome;
        self
    }

    pub fn build(self) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let github = Arc::new(self.github);
        let host = Arc::new(FakeHost::default());
        let vcs = Arc::new(FakeVcs::new(self.merge_outcome));
        let services = Services {
            github: github.clone(),
            launchpad: Arc::new(self.launchpad),
            vm_host: host.clone(),
            vcs: vcs.clone(),
        };
        let engine = Arc::new(build_engine(&store, &services, &self.settings));
        Harness {
            store,
            engine,
            settings: self.settings,
            github,
            host,
            vcs,
        }
    }
}

impl Harness {
    /// Wait until the root instance records `phase`.
    pub async fn wait_for_phase(&self, workflow_id: &str, phase: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = self
                .engine
                .describe(workflow_id)
                .await
                .unwrap()
                .and_then(|i| i.phase);
            if current.as_deref() == Some(phase) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never reached {} (at {:?})",
                workflow_id,
                phase,
                current
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn phase(&self, workflow_id: &str) -> Option<String> {
        self.engine
            .describe(workflow_id)
            .await
            .unwrap()
            .and_then(|i| i.phase)
    }
}
