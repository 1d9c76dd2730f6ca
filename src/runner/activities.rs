use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spaghettihub_common::{RunnerSagaId, size_for_labels};
use tracing::{debug, info, warn};

use super::cloud_init::{RunnerRelease, runner_user_data};
use crate::clients::{GitHubApi, ImageSource, InstanceSpec, InstanceState, RegistrationToken, VmHost};
use crate::engine::{Activity, ActivityContext};
use crate::errors::{ActivityError, VmHostError};

/// Interval at which long VM host calls report liveness.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

/// Mints a one-time runner registration token. No side effects, so the
/// step can be retried freely.
pub struct GetRegistrationToken {
    github: Arc<dyn GitHubApi>,
}

impl GetRegistrationToken {
    pub fn new(github: Arc<dyn GitHubApi>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Activity for GetRegistrationToken {
    const NAME: &'static str = "get-registration-token";
    type Input = RunnerSagaId;
    type Output = RegistrationToken;

    async fn run(&self, _ctx: ActivityContext, id: RunnerSagaId) -> Result<RegistrationToken, ActivityError> {
        let token = self.github.create_registration_token().await?;
        debug!(run_id = id.run_id(), "Obtained runner registration token");
        Ok(token)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SpawnRunnerInput {
    pub id: RunnerSagaId,
    pub labels: Vec<String>,
    pub registration_token: String,
}

impl std::fmt::Debug for SpawnRunnerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnRunnerInput")
            .field("id", &self.id)
            .field("labels", &self.labels)
            .field("registration_token", &"<redacted>")
            .finish()
    }
}

/// Where and how runner VMs are created.
#[derive(Debug, Clone)]
pub struct SpawnSettings {
    /// Repository URL the runner agent registers against.
    pub repository_url: String,
    pub release: RunnerRelease,
    pub image: ImageSource,
    pub storage_pool: String,
}

/// Creates and boots the VM `runner-<run_id>`.
///
/// Checks for an existing instance first so a retry after a partial failure
/// reuses the VM instead of tripping over the name.
pub struct SpawnRunner {
    host: Arc<dyn VmHost>,
    settings: SpawnSettings,
}

impl SpawnRunner {
    pub fn new(host: Arc<dyn VmHost>, settings: SpawnSettings) -> Self {
        Self { host, settings }
    }
}

#[async_trait]
impl Activity for SpawnRunner {
    const NAME: &'static str = "spawn-runner";
    type Input = SpawnRunnerInput;
    type Output = String;

    async fn run(&self, ctx: ActivityContext, input: SpawnRunnerInput) -> Result<String, ActivityError> {
        let name = input.id.vm_name();
        ctx.heartbeat();

        match self.host.instance_state(&name).await {
            Ok(InstanceState::Running) => {
                info!(vm = %name, "Runner VM already running");
                return Ok(name);
            }
            Ok(state) => {
                info!(vm = %name, ?state, "Runner VM exists, starting it");
                ctx.heartbeat_while(HEARTBEAT_EVERY, self.host.start_instance(&name))
                    .await?;
                return Ok(name);
            }
            Err(VmHostError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let user_data = runner_user_data(
            input.id,
            &self.settings.repository_url,
            &input.registration_token,
            &input.labels,
            &self.settings.release,
        )
        .map_err(|e| ActivityError::non_retryable(e.to_string()))?;

        let spec = InstanceSpec {
            name: name.clone(),
            size: size_for_labels(&input.labels),
            image: self.settings.image.clone(),
            storage_pool: self.settings.storage_pool.clone(),
            user_data,
        };
        info!(
            vm = %name,
            cpu = spec.size.cpu_cores,
            memory = %spec.size.memory,
            disk = %spec.size.disk,
            "Creating runner VM"
        );
        ctx.heartbeat_while(HEARTBEAT_EVERY, self.host.create_instance(&spec))
            .await?;
        ctx.heartbeat_while(HEARTBEAT_EVERY, self.host.start_instance(&name))
            .await?;
        info!(vm = %name, "Runner VM started");
        Ok(name)
    }
}

/// Forced stop and delete of `runner-<run_id>`. An instance that is already
/// gone counts as destroyed.
pub struct DestroyRunner {
    host: Arc<dyn VmHost>,
}

impl DestroyRunner {
    pub fn new(host: Arc<dyn VmHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Activity for DestroyRunner {
    const NAME: &'static str = "destroy-runner";
    type Input = RunnerSagaId;
    type Output = ();

    async fn run(&self, ctx: ActivityContext, id: RunnerSagaId) -> Result<(), ActivityError> {
        let name = id.vm_name();

        match ctx
            .heartbeat_while(HEARTBEAT_EVERY, self.host.stop_instance(&name, true))
            .await
        {
            Ok(()) => {}
            Err(VmHostError::NotFound(_)) => {
                info!(vm = %name, "Runner VM already gone");
                return Ok(());
            }
            // Stopping an already stopped instance is an error on some hosts.
            Err(e) => match self.host.instance_state(&name).await {
                Ok(InstanceState::Stopped) => {}
                Err(VmHostError::NotFound(_)) => return Ok(()),
                _ => return Err(e.into()),
            },
        }

        match ctx
            .heartbeat_while(HEARTBEAT_EVERY, self.host.delete_instance(&name))
            .await
        {
            Ok(()) => {
                info!(vm = %name, "Runner VM destroyed");
                Ok(())
            }
            Err(VmHostError::NotFound(_)) => {
                warn!(vm = %name, "Runner VM vanished before delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Host {
        states: Mutex<HashMap<String, InstanceState>>,
        created: Mutex<Vec<InstanceSpec>>,
        deletes: Mutex<u32>,
    }

    #[async_trait]
    impl VmHost for Host {
        async fn instance_state(&self, name: &str) -> Result<InstanceState, VmHostError> {
            self.states
                .lock()
                .unwrap()
                .get(name)
                .copied()
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
            let mut states = self.states.lock().unwrap();
            match states.get_mut(name) {
                Some(InstanceState::Stopped) => Err(VmHostError::Api {
                    status: 400,
                    message: "The instance is already stopped".into(),
                }),
                Some(state) => {
                    *state = InstanceState::Stopped;
                    Ok(())
                }
                None => Err(VmHostError::NotFound(name.to_string())),
            }
        }

        async fn delete_instance(&self, name: &str) -> Result<(), VmHostError> {
            *self.deletes.lock().unwrap() += 1;
            self.states
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| VmHostError::NotFound(name.to_string()))
        }
    }

    fn settings() -> SpawnSettings {
        SpawnSettings {
            repository_url: "https://github.com/SpaghettiHub/maas".into(),
            release: RunnerRelease::default(),
            image: ImageSource::default(),
            storage_pool: "default".into(),
        }
    }

    fn input(labels: &[&str]) -> SpawnRunnerInput {
        SpawnRunnerInput {
            id: RunnerSagaId::new(42),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            registration_token: "AABF3".into(),
        }
    }

    #[tokio::test]
    async fn test_spawn_creates_sized_vm_and_starts_it() {
        let host = Arc::new(Host::default());
        let activity = SpawnRunner::new(host.clone(), settings());
        let name = activity
            .run(ActivityContext::standalone(SpawnRunner::NAME), input(&["self-hosted", "large-runner"]))
            .await
            .unwrap();

        assert_eq!(name, "runner-42");
        let created = host.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].size.cpu_cores, 6);
        assert!(created[0].user_data.contains("--name runner-42"));
        assert_eq!(host.states.lock().unwrap()["runner-42"], InstanceState::Running);
    }

    #[tokio::test]
    async fn test_spawn_reuses_existing_instance() {
        let host = Arc::new(Host::default());
        host.states
            .lock()
            .unwrap()
            .insert("runner-42".into(), InstanceState::Stopped);
        let activity = SpawnRunner::new(host.clone(), settings());
        activity
            .run(ActivityContext::standalone(SpawnRunner::NAME), input(&[]))
            .await
            .unwrap();

        assert!(host.created.lock().unwrap().is_empty());
        assert_eq!(host.states.lock().unwrap()["runner-42"], InstanceState::Running);
    }

    #[tokio::test]
    async fn test_spawn_with_unsafe_token_is_not_retryable() {
        let host = Arc::new(Host::default());
        let activity = SpawnRunner::new(host.clone(), settings());
        let mut bad = input(&[]);
        bad.registration_token = "x; reboot".into();
        let err = activity
            .run(ActivityContext::standalone(SpawnRunner::NAME), bad)
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(host.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_running_and_already_stopped() {
        let host = Arc::new(Host::default());
        let destroy = DestroyRunner::new(host.clone());
        let id = RunnerSagaId::new(42);

        host.states
            .lock()
            .unwrap()
            .insert("runner-42".into(), InstanceState::Running);
        destroy
            .run(ActivityContext::standalone(DestroyRunner::NAME), id)
            .await
            .unwrap();
        assert!(host.states.lock().unwrap().is_empty());

        host.states
            .lock()
            .unwrap()
            .insert("runner-42".into(), InstanceState::Stopped);
        destroy
            .run(ActivityContext::standalone(DestroyRunner::NAME), id)
            .await
            .unwrap();
        assert!(host.states.lock().unwrap().is_empty());
        assert_eq!(*host.deletes.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_destroy_missing_vm_succeeds() {
        let host = Arc::new(Host::default());
        DestroyRunner::new(host.clone())
            .run(ActivityContext::standalone(DestroyRunner::NAME), RunnerSagaId::new(7))
            .await
            .unwrap();
        assert_eq!(*host.deletes.lock().unwrap(), 0);
    }
}
