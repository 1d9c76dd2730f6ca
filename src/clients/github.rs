use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "spaghettihub";

/// Short-lived token an Actions runner registers itself with.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body of `POST /repos/{repo}/pulls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    /// `owner:branch` of the fork.
    pub head: String,
    pub base: String,
}

/// A created pull request (subset of fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub html_url: String,
}

/// The GitHub operations the sagas need.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken>;

    async fn create_pull_request(&self, request: &NewPullRequest) -> anyhow::Result<PullRequest>;
}

/// REST client bound to one repository.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    repository: String,
    token: String,
    runner_token: String,
}

impl GitHubClient {
    /// `token` opens pull requests; `runner_token` needs admin rights on the
    /// repository to mint runner registration tokens.
    pub fn new(
        api_url: impl Into<String>,
        repository: impl Into<String>,
        token: impl Into<String>,
        runner_token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            token: token.into(),
            runner_token: runner_token.into(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, self.repository, path)
    }

    fn post(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
            .header("Authorization", format!("Bearer {}", token))
    }
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken> {
        let url = self.repo_url("actions/runners/registration-token");
        self.post(&url, &self.runner_token)
            .send()
            .await
            .context("Failed to send registration token request to GitHub")?
            .error_for_status()
            .context("GitHub registration token endpoint returned error status")?
            .json::<RegistrationToken>()
            .await
            .context("Failed to parse registration token response from GitHub")
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> anyhow::Result<PullRequest> {
        let url = self.repo_url("pulls");
        self.post(&url, &self.token)
            .json(request)
            .send()
            .await
            .context("Failed to send create pull request to GitHub")?
            .error_for_status()
            .context("GitHub pulls API returned error status")?
            .json::<PullRequest>()
            .await
            .context("Failed to parse pull request response from GitHub")
    }
}
