//! Layered configuration for SpaghettiHub.
//!
//! Values come from `spaghettihub.toml` (every field optional), then from the
//! environment (secrets and the database path), then from CLI flags.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//!
//! [database]
//! path = "/var/lib/spaghettihub/spaghettihub.db"
//!
//! [github]
//! repository = "canonical/maas"
//!
//! [release_pipeline]
//! workflow_name = "Continuous delivery pipeline"
//!
//! [lxd]
//! endpoint = "https://10.0.0.1:8443"
//! client_cert = "/etc/spaghettihub/lxd.crt"
//! client_key = "/etc/spaghettihub/lxd.key"
//!
//! [runner]
//! execution_timeout_secs = 86400
//!
//! [porting]
//! fork_owner = "r00tabot"
//! fork_url = "git@github.com:r00tabot/maas.git"
//!
//! [logging]
//! format = "json"
//! directory = "/var/log/spaghettihub"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::clients::ImageSource;
use crate::commit_tracker::TrackerSettings;
use crate::porting::{GitVcsSettings, PortingSagaSettings, PullRequestSettings};
use crate::runner::{RunnerRelease, RunnerSagaSettings, SpawnSettings};
use crate::server::ServerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "spaghettihub.toml";

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            dev_mode: defaults.dev_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
    /// Upper bound on activities running at once across all workflows.
    pub max_concurrent_activities: usize,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spaghettihub.db"),
            max_concurrent_activities: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub api_url: String,
    /// `owner/name` of the repository runners serve and pull requests target.
    pub repository: String,
    /// Opens pull requests.
    pub token: String,
    /// Needs admin rights to mint runner registration tokens.
    pub runner_token: String,
    pub webhook_secret: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: crate::clients::github::DEFAULT_API_URL.to_string(),
            repository: "canonical/maas".to_string(),
            token: String::new(),
            runner_token: String::new(),
            webhook_secret: String::new(),
        }
    }
}

impl GitHubSection {
    pub fn repository_url(&self) -> String {
        format!("https://github.com/{}", self.repository)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleasePipelineSection {
    pub mainline_branch: String,
    pub workflow_name: String,
    pub branch: String,
}

impl Default for ReleasePipelineSection {
    fn default() -> Self {
        let defaults = TrackerSettings::default();
        Self {
            mainline_branch: defaults.mainline_branch,
            workflow_name: defaults.pipeline_workflow,
            branch: defaults.pipeline_branch,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LxdSection {
    pub endpoint: String,
    pub project: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub trust_password: String,
    pub accept_invalid_certs: bool,
    pub storage_pool: String,
    pub operation_timeout_secs: u64,
    pub image: ImageSource,
}

impl Default for LxdSection {
    fn default() -> Self {
        Self {
            endpoint: "https://127.0.0.1:8443".to_string(),
            project: "default".to_string(),
            client_cert: None,
            client_key: None,
            trust_password: String::new(),
            accept_invalid_certs: true,
            storage_pool: "default".to_string(),
            operation_timeout_secs: 600,
            image: ImageSource::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// How long a runner may wait for its job to finish before teardown.
    pub execution_timeout_secs: u64,
    pub release: RunnerRelease,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            execution_timeout_secs: RunnerSagaSettings::default().execution_timeout.as_secs(),
            release: RunnerRelease::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortingSection {
    pub launchpad_api_root: String,
    pub upstream_url: String,
    pub fork_url: String,
    pub fork_owner: String,
    pub base_branch: String,
    pub mirror_dir: PathBuf,
    pub work_root: PathBuf,
    pub committer_name: String,
    pub committer_email: String,
    pub execution_timeout_secs: u64,
}

impl Default for PortingSection {
    fn default() -> Self {
        Self {
            launchpad_api_root: crate::clients::launchpad::DEFAULT_API_ROOT.to_string(),
            upstream_url: "https://git.launchpad.net/maas".to_string(),
            fork_url: "git@github.com:r00tabot/maas.git".to_string(),
            fork_owner: "r00tabot".to_string(),
            base_branch: "master".to_string(),
            mirror_dir: PathBuf::from("repos/mirror"),
            work_root: PathBuf::from("repos/work"),
            committer_name: "SpaghettiHub".to_string(),
            committer_email: "spaghettihub@localhost".to_string(),
            execution_timeout_secs: PortingSagaSettings::default().execution_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Daily rolling log files go here when set.
    pub directory: Option<PathBuf>,
    /// Used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub github: GitHubSection,
    pub release_pipeline: ReleasePipelineSection,
    pub lxd: LxdSection,
    pub runner: RunnerSection,
    pub porting: PortingSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse spaghettihub.toml")
    }

    /// Defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env` and the process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override secrets and the database path from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = present("SPAGHETTIHUB_WEBHOOK_SECRET") {
            self.github.webhook_secret = v;
        }
        if let Some(v) = present("GITHUB_TOKEN") {
            self.github.token = v;
        }
        if let Some(v) = present("GITHUB_RUNNER_TOKEN") {
            self.github.runner_token = v;
        }
        if let Some(v) = present("LXD_TRUST_PASSWORD") {
            self.lxd.trust_password = v;
        }
        if let Some(v) = present("SPAGHETTIHUB_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
    }

    /// Problems that prevent serving. Empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.github.webhook_secret.is_empty() {
            problems.push(
                "github.webhook_secret is empty (set SPAGHETTIHUB_WEBHOOK_SECRET)".to_string(),
            );
        }
        if !self.github.repository.contains('/') {
            problems.push(format!(
                "github.repository '{}' is not of the form owner/name",
                self.github.repository
            ));
        }
        if self.database.max_concurrent_activities == 0 {
            problems.push("database.max_concurrent_activities must be at least 1".to_string());
        }
        let sha = &self.runner.release.sha256;
        if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            problems.push("runner.release.sha256 is not a SHA-256 hex digest".to_string());
        }
        if self.lxd.client_cert.is_some() != self.lxd.client_key.is_some() {
            problems.push("lxd.client_cert and lxd.client_key must be set together".to_string());
        }
        problems
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in [
            &mut copy.github.token,
            &mut copy.github.runner_token,
            &mut copy.github.webhook_secret,
            &mut copy.lxd.trust_password,
        ] {
            if !secret.is_empty() {
                *secret = REDACTED.to_string();
            }
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            dev_mode: self.server.dev_mode,
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            mainline_branch: self.release_pipeline.mainline_branch.clone(),
            pipeline_workflow: self.release_pipeline.workflow_name.clone(),
            pipeline_branch: self.release_pipeline.branch.clone(),
        }
    }

    pub fn runner_saga_settings(&self) -> RunnerSagaSettings {
        RunnerSagaSettings {
            execution_timeout: Duration::from_secs(self.runner.execution_timeout_secs),
            ..RunnerSagaSettings::default()
        }
    }

    pub fn spawn_settings(&self) -> SpawnSettings {
        SpawnSettings {
            repository_url: self.github.repository_url(),
            release: self.runner.release.clone(),
            image: self.lxd.image.clone(),
            storage_pool: self.lxd.storage_pool.clone(),
        }
    }

    pub fn porting_saga_settings(&self) -> PortingSagaSettings {
        PortingSagaSettings {
            execution_timeout: Duration::from_secs(self.porting.execution_timeout_secs),
            ..PortingSagaSettings::default()
        }
    }

    pub fn git_vcs_settings(&self) -> GitVcsSettings {
        GitVcsSettings {
            mirror_dir: self.porting.mirror_dir.clone(),
            work_root: self.porting.work_root.clone(),
            fork_url: self.porting.fork_url.clone(),
            upstream_url: self.porting.upstream_url.clone(),
            base_branch: self.porting.base_branch.clone(),
            committer_name: self.porting.committer_name.clone(),
            committer_email: self.porting.committer_email.clone(),
        }
    }

    pub fn pull_request_settings(&self) -> PullRequestSettings {
        PullRequestSettings {
            fork_owner: self.porting.fork_owner.clone(),
            base_branch: self.porting.base_branch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.github.repository, "canonical/maas");
        assert_eq!(config.release_pipeline.workflow_name, "Continuous delivery pipeline");
        assert_eq!(config.runner.execution_timeout_secs, 24 * 60 * 60);
        assert_eq!(config.porting.execution_timeout_secs, 15 * 60);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::parse(
            r#"
[server]
port = 9000

[lxd]
storage_pool = "fast"

[lxd.image]
alias = "22.04"

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.lxd.storage_pool, "fast");
        assert_eq!(config.lxd.image.alias, "22.04");
        assert_eq!(config.lxd.image.protocol, "simplestreams");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(AppConfig::parse("[server\nport = 1").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.database.path, PathBuf::from("spaghettihub.db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[github]\nrepository = \"o/r\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.github.repository_url(), "https://github.com/o/r");
    }

    #[test]
    fn test_environment_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            ("SPAGHETTIHUB_WEBHOOK_SECRET", "hook"),
            ("GITHUB_TOKEN", "gh"),
            ("GITHUB_RUNNER_TOKEN", ""),
            ("SPAGHETTIHUB_DB_PATH", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::parse("[github]\nrunner_token = \"from-file\"\n").unwrap();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.github.webhook_secret, "hook");
        assert_eq!(config.github.token, "gh");
        assert_eq!(config.github.runner_token, "from-file");
        assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_validate_requires_webhook_secret() {
        let mut config = AppConfig::default();
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("webhook_secret"));

        config.github.webhook_secret = "s".into();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_digest_and_half_certificate() {
        let mut config = AppConfig::default();
        config.github.webhook_secret = "s".into();
        config.runner.release.sha256 = "abc".into();
        config.lxd.client_cert = Some(PathBuf::from("/c.crt"));
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn test_redacted_hides_only_set_secrets() {
        let mut config = AppConfig::default();
        config.github.webhook_secret = "super-secret".into();
        config.lxd.trust_password = "pw".into();

        let shown = config.redacted().to_toml().unwrap();
        assert!(!shown.contains("super-secret"));
        assert!(!shown.contains("\"pw\""));
        assert!(shown.contains(REDACTED));
        assert!(shown.contains("token = \"\""));
    }

    #[test]
    fn test_settings_mapping() {
        let mut config = AppConfig::default();
        config.runner.execution_timeout_secs = 120;
        config.porting.fork_owner = "bot".into();

        assert_eq!(config.runner_saga_settings().execution_timeout, Duration::from_secs(120));
        assert_eq!(config.pull_request_settings().fork_owner, "bot");
        assert_eq!(config.spawn_settings().repository_url, "https://github.com/canonical/maas");
        assert_eq!(config.tracker_settings(), TrackerSettings::default());
        assert_eq!(config.git_vcs_settings().base_branch, "master");
    }
}
