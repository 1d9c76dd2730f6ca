//! Cloud-init user-data that turns a fresh Ubuntu VM into an ephemeral
//! GitHub Actions runner.

use serde::{Deserialize, Serialize};
use spaghettihub_common::RunnerSagaId;
use tracing::warn;

const RUNNER_HOME: &str = "/home/runner/actions-runner";

/// Pinned release of the Actions runner agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerRelease {
    pub version: String,
    /// SHA-256 of the linux-x64 tarball.
    pub sha256: String,
}

impl Default for RunnerRelease {
    fn default() -> Self {
        Self {
            version: "2.323.0".to_string(),
            sha256: "0dbc9bf5a58620fc52cb6cc0448abcca964a8d74b5f39773b7afcad9ab691e19".to_string(),
        }
    }
}

impl RunnerRelease {
    pub fn tarball(&self) -> String {
        format!("actions-runner-linux-x64-{}.tar.gz", self.version)
    }

    pub fn download_url(&self) -> String {
        format!(
            "https://github.com/actions/runner/releases/download/v{}/{}",
            self.version,
            self.tarball()
        )
    }
}

/// Characters allowed in anything interpolated into a shell command.
fn is_shell_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Labels that can be passed to `config.sh`. Anything else is dropped.
pub fn usable_labels(labels: &[String]) -> Vec<&str> {
    labels
        .iter()
        .filter_map(|label| {
            if is_shell_safe(label) {
                Some(label.as_str())
            } else {
                warn!(label = %label, "Dropping runner label with unsupported characters");
                None
            }
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
#[error("Registration token contains unsupported characters")]
pub struct UnsafeToken;

/// Render the `#cloud-config` document for runner `id`.
pub fn runner_user_data(
    id: RunnerSagaId,
    repository_url: &str,
    registration_token: &str,
    labels: &[String],
    release: &RunnerRelease,
) -> Result<String, UnsafeToken> {
    if !is_shell_safe(registration_token) {
        return Err(UnsafeToken);
    }
    let labels = usable_labels(labels).join(",");
    let tarball = release.tarball();

    let mut config = format!(
        "--unattended --ephemeral --name {} --url {} --token {}",
        id.vm_name(),
        repository_url,
        registration_token
    );
    if !labels.is_empty() {
        config.push_str(&format!(" --labels {}", labels));
    }

    let commands = [
        "useradd runner".to_string(),
        "mkhomedir_helper runner".to_string(),
        "\"echo 'runner ALL=(ALL) NOPASSWD: ALL' | tee /etc/sudoers.d/runner\"".to_string(),
        "usermod -a -G lxd runner".to_string(),
        as_runner("git config --global user.name 'r00tabot runner'"),
        as_runner("git config --global user.email example@example.com"),
        as_runner(&format!("mkdir -p {}", RUNNER_HOME)),
        as_runner(&format!(
            "curl -o {}/{} -L {}",
            RUNNER_HOME,
            tarball,
            release.download_url()
        )),
        as_runner(&format!(
            "echo '{}  {}/{}' | shasum -a 256 -c",
            release.sha256, RUNNER_HOME, tarball
        )),
        as_runner(&format!("cd {} && tar xzf ./{}", RUNNER_HOME, tarball)),
        as_runner(&format!("{}/config.sh {}", RUNNER_HOME, config)),
        as_runner(&format!("{}/run.sh &", RUNNER_HOME)),
    ];

    let mut doc = String::from("#cloud-config\npackages:\n  - curl\n  - git\nruncmd:\n");
    for command in commands {
        doc.push_str("  - ");
        doc.push_str(&command);
        doc.push('\n');
    }
    Ok(doc)
}

fn as_runner(command: &str) -> String {
    format!("su runner -c \"{}\"", command)
}
