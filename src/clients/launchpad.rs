use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const WEB_ROOT: &str = "https://code.launchpad.net";
pub const DEFAULT_API_ROOT: &str = "https://api.launchpad.net/devel";

/// Everything the porting saga needs to know about a merge proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeProposal {
    pub id: u64,
    pub web_url: String,
    /// Launchpad username without the leading `~`.
    pub registrant: String,
    /// Source branch name without `refs/heads/`.
    pub source_branch: String,
    /// HTTPS clone URL of the source repository.
    pub source_repository: String,
    pub description: Option<String>,
    pub commit_message: Option<String>,
    /// Unified diff of the proposal.
    pub diff: String,
}

/// Proposal id of a `https://code.launchpad.net/.../+merge/<id>` URL.
pub fn merge_proposal_id(web_url: &str) -> Option<u64> {
    let rest = web_url.trim().strip_prefix(WEB_ROOT)?;
    let (_, id) = rest.trim_end_matches('/').rsplit_once("/+merge/")?;
    id.parse().ok()
}

#[derive(Debug, Deserialize)]
struct ProposalResource {
    registrant_link: String,
    source_git_path: String,
    source_git_repository_link: String,
    preview_diff_link: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    commit_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRepositoryResource {
    git_https_url: String,
}

#[async_trait]
pub trait LaunchpadApi: Send + Sync {
    async fn fetch_merge_proposal(&self, web_url: &str) -> anyhow::Result<MergeProposal>;
}

/// Anonymous client for the public Launchpad REST API.
#[derive(Clone)]
pub struct LaunchpadClient {
    http: reqwest::Client,
    api_root: String,
}

impl Default for LaunchpadClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_ROOT)
    }
}

impl LaunchpadClient {
    pub fn new(api_root: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_root: api_root.into().trim_end_matches('/').to_string(),
        }
    }

    /// API resource URL for a web URL under `code.launchpad.net`.
    pub fn api_url_for(&self, web_url: &str) -> Option<String> {
        let rest = web_url.trim().strip_prefix(WEB_ROOT)?;
        Some(format!("{}{}", self.api_root, rest.trim_end_matches('/')))
    }

    async fn get(&self, url: &str, what: &str) -> anyhow::Result<reqwest::Response> {
        self.http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to request {} from Launchpad", what))?
            .error_for_status()
            .with_context(|| format!("Launchpad returned error status for {}", what))
    }
}

#[async_trait]
impl LaunchpadApi for LaunchpadClient {
    async fn fetch_merge_proposal(&self, web_url: &str) -> anyhow::Result<MergeProposal> {
        let Some(id) = merge_proposal_id(web_url) else {
            bail!("Not a Launchpad merge proposal URL: {}", web_url);
        };
        let Some(api_url) = self.api_url_for(web_url) else {
            bail!("Not a Launchpad merge proposal URL: {}", web_url);
        };

        let proposal: ProposalResource = self
            .get(&api_url, "merge proposal")
            .await?
            .json()
            .await
            .context("Failed to parse merge proposal from Launchpad")?;

        let Some(diff_link) = proposal.preview_diff_link.as_deref() else {
            bail!("Merge proposal {} has no preview diff", id);
        };
        let diff = self
            .get(&format!("{}/+files/preview.diff", diff_link), "preview diff")
            .await?
            .text()
            .await
            .context("Failed to read preview diff from Launchpad")?;

        let repository: GitRepositoryResource = self
            .get(&proposal.source_git_repository_link, "source repository")
            .await?
            .json()
            .await
            .context("Failed to parse source repository from Launchpad")?;

        let registrant = proposal
            .registrant_link
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim_start_matches('~')
            .to_string();
        let source_branch = proposal
            .source_git_path
            .strip_prefix("refs/heads/")
            .unwrap_or(&proposal.source_git_path)
            .to_string();

        Ok(MergeProposal {
            id,
            web_url: web_url.trim().to_string(),
            registrant,
            source_branch,
            source_repository: repository.git_https_url,
            description: proposal.description,
            commit_message: proposal.commit_message,
            diff,
        })
    }
}
