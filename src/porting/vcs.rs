//! Version control operations behind the porting saga.
//!
//! Network operations (clone, fetch, push) shell out to the `git` CLI so
//! they pick up the host's SSH configuration. Merge analysis, branch
//! manipulation, patch application and commits go through `git2`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{ApplyLocation, BranchType, Diff, Repository, Signature, build::CheckoutBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of trying to merge a proposal branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The branch holds a clean merge of the proposal.
    Merged,
    /// Three-way merge hit conflicts; nothing was committed.
    Conflicted,
}

/// Everything the porting saga does to git repositories. Each operation is
/// safe to repeat.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Reset the fork's base branch to the upstream mirror and force-push it.
    async fn sync_fork(&self) -> Result<()>;

    /// Create `branch` from the fork's base branch in a fresh workspace and
    /// merge `source_branch` of `source_repository` into it.
    async fn merge_proposal(
        &self,
        branch: &str,
        source_repository: &str,
        source_branch: &str,
    ) -> Result<MergeOutcome>;

    /// Recreate `branch` from the base branch and commit `diff` applied as a
    /// patch.
    async fn apply_patch(&self, branch: &str, diff: &str, message: &str) -> Result<()>;

    /// Force-push `branch` to the fork.
    async fn push_branch(&self, branch: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GitVcsSettings {
    /// Long-lived checkout of the fork, synced with upstream.
    pub mirror_dir: PathBuf,
    /// Parent of the per-request workspaces.
    pub work_root: PathBuf,
    /// Push URL of the fork (`git@github.com:r00tabot/maas.git`).
    pub fork_url: String,
    /// Upstream repository the fork tracks.
    pub upstream_url: String,
    pub base_branch: String,
    pub committer_name: String,
    pub committer_email: String,
}

/// [`Vcs`] over real repositories on disk.
pub struct GitVcs {
    settings: GitVcsSettings,
    mirror_lock: Mutex<()>,
}

const PROPOSAL_REMOTE: &str = "proposal";

impl GitVcs {
    pub fn new(settings: GitVcsSettings) -> Self {
        Self {
            settings,
            mirror_lock: Mutex::new(()),
        }
    }

    fn workspace(&self, branch: &str) -> PathBuf {
        self.settings.work_root.join(branch)
    }

    fn committer(&self) -> Committer {
        Committer {
            name: self.settings.committer_name.clone(),
            email: self.settings.committer_email.clone(),
        }
    }
}

struct Committer {
    name: String,
    email: String,
}

impl Committer {
    fn signature(&self) -> Result<Signature<'static>> {
        Signature::now(&self.name, &self.email).context("Failed to build commit signature")
    }
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    debug!(dir = %dir.display(), ?args, "Running git");
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn force_checkout() -> CheckoutBuilder<'static> {
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    checkout
}

/// Point HEAD at a new `branch` starting at `base`, replacing any existing
/// branch of that name.
fn reset_branch(repo: &Repository, branch: &str, base: &str) -> Result<()> {
    let base_commit = repo
        .find_branch(base, BranchType::Local)
        .with_context(|| format!("Base branch {} not found", base))?
        .get()
        .peel_to_commit()?;
    repo.set_head(&format!("refs/heads/{}", base))?;
    repo.checkout_head(Some(&mut force_checkout()))?;
    repo.branch(branch, &base_commit, true)
        .with_context(|| format!("Failed to create branch {}", branch))?;
    repo.set_head(&format!("refs/heads/{}", branch))?;
    repo.checkout_head(Some(&mut force_checkout()))?;
    Ok(())
}

fn merge_into_head(repo: &Repository, theirs_ref: &str, signature: &Signature<'_>) -> Result<MergeOutcome> {
    let reference = repo
        .find_reference(theirs_ref)
        .with_context(|| format!("Fetched ref {} not found", theirs_ref))?;
    let annotated = repo.reference_to_annotated_commit(&reference)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;

    if analysis.is_up_to_date() {
        return Ok(MergeOutcome::Merged);
    }

    let theirs = repo.find_commit(annotated.id())?;
    if analysis.is_fast_forward() {
        let mut head = repo.head()?;
        head.set_target(theirs.id(), "fast-forward proposal branch")?;
        repo.checkout_head(Some(&mut force_checkout()))?;
        return Ok(MergeOutcome::Merged);
    }

    let ours = repo.head()?.peel_to_commit()?;
    let mut index = repo.merge_commits(&ours, &theirs, None)?;
    if index.has_conflicts() {
        return Ok(MergeOutcome::Conflicted);
    }
    let tree = repo.find_tree(index.write_tree_to(repo)?)?;
    repo.commit(
        Some("HEAD"),
        signature,
        signature,
        &format!("Merge {}", theirs_ref.trim_start_matches("refs/remotes/")),
        &tree,
        &[&ours, &theirs],
    )?;
    repo.checkout_head(Some(&mut force_checkout()))?;
    Ok(MergeOutcome::Merged)
}

fn commit_patch(
    repo: &Repository,
    diff: &str,
    message: &str,
    signature: &Signature<'_>,
) -> Result<()> {
    let diff = Diff::from_buffer(diff.as_bytes()).context("Failed to parse proposal diff")?;
    repo.apply(&diff, ApplyLocation::Both, None)
        .context("Proposal diff does not apply to the base branch")?;
    let mut index = repo.index()?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let parent = repo.head()?.peel_to_commit()?;
    repo.commit(Some("HEAD"), signature, signature, message, &tree, &[&parent])?;
    Ok(())
}

#[async_trait]
impl Vcs for GitVcs {
    async fn sync_fork(&self) -> Result<()> {
        let _guard = self.mirror_lock.lock().await;
        let s = &self.settings;

        if !s.mirror_dir.join(".git").exists() {
            let parent = s.mirror_dir.parent().unwrap_or(Path::new("."));
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create mirror parent directory")?;
            let target = s.mirror_dir.to_string_lossy();
            git(parent, &["clone", &s.fork_url, &target]).await?;
            git(&s.mirror_dir, &["remote", "add", "mirror", &s.upstream_url]).await?;
            info!(dir = %s.mirror_dir.display(), "Cloned fork mirror");
        }

        let upstream_base = format!("mirror/{}", s.base_branch);
        git(&s.mirror_dir, &["fetch", "mirror"]).await?;
        git(&s.mirror_dir, &["checkout", "-B", &s.base_branch, &upstream_base]).await?;
        git(&s.mirror_dir, &["reset", "--hard", &upstream_base]).await?;
        git(&s.mirror_dir, &["push", "origin", &s.base_branch, "-f"]).await?;
        info!(branch = %s.base_branch, "Fork synced with upstream");
        Ok(())
    }

    async fn merge_proposal(
        &self,
        branch: &str,
        source_repository: &str,
        source_branch: &str,
    ) -> Result<MergeOutcome> {
        let s = &self.settings;
        let workspace = self.workspace(branch);
        if workspace.exists() {
            tokio::fs::remove_dir_all(&workspace)
                .await
                .context("Failed to clear previous workspace")?;
        }
        tokio::fs::create_dir_all(&s.work_root)
            .await
            .context("Failed to create work root")?;

        {
            let _guard = self.mirror_lock.lock().await;
            let mirror = s.mirror_dir.to_string_lossy();
            let target = workspace.to_string_lossy();
            git(&s.work_root, &["clone", "--branch", &s.base_branch, &mirror, &target]).await?;
        }
        git(&workspace, &["remote", "set-url", "origin", &s.fork_url]).await?;
        git(&workspace, &["remote", "add", PROPOSAL_REMOTE, source_repository]).await?;
        let refspec = format!(
            "+refs/heads/{}:refs/remotes/{}/{}",
            source_branch, PROPOSAL_REMOTE, source_branch
        );
        git(&workspace, &["fetch", PROPOSAL_REMOTE, &refspec]).await?;

        let branch = branch.to_string();
        let base = s.base_branch.clone();
        let theirs = format!("refs/remotes/{}/{}", PROPOSAL_REMOTE, source_branch);
        let committer = self.committer();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&workspace).context("Failed to open workspace")?;
            reset_branch(&repo, &branch, &base)?;
            merge_into_head(&repo, &theirs, &committer.signature()?)
        })
        .await
        .context("Merge task panicked")?
    }

    async fn apply_patch(&self, branch: &str, diff: &str, message: &str) -> Result<()> {
        let workspace = self.workspace(branch);
        let branch = branch.to_string();
        let base = self.settings.base_branch.clone();
        let diff = diff.to_string();
        let message = message.to_string();
        let committer = self.committer();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&workspace).context("Failed to open workspace")?;
            reset_branch(&repo, &branch, &base)?;
            commit_patch(&repo, &diff, &message, &committer.signature()?)
        })
        .await
        .context("Patch task panicked")?
    }

    async fn push_branch(&self, branch: &str) -> Result<()> {
        let workspace = self.workspace(branch);
        git(&workspace, &["push", "--force", "origin", branch]).await?;
        info!(branch, "Pushed pull request branch");
        tokio::fs::remove_dir_all(&workspace)
            .await
            .context("Failed to remove workspace")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use git2::RepositoryInitOptions;
    use tempfile::TempDir;

    use super::*;

    fn init(path: &Path, bare: bool) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.bare(bare).initial_head("master");
        Repository::init_opts(path, &opts).unwrap()
    }

    fn commit_file(repo: &Repository, name: &str, content: &str, msg: &str) {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent]),
            None => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[]),
        }
        .unwrap();
    }

    fn checkout_new_branch(repo: &Repository, name: &str) {
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch(name, &head, true).unwrap();
        repo.set_head(&format!("refs/heads/{}", name)).unwrap();
        repo.checkout_head(Some(&mut force_checkout())).unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        upstream: PathBuf,
        contributor: PathBuf,
        fork: PathBuf,
        vcs: GitVcs,
    }

    /// Upstream with `a.txt`, a contributor clone with branch `fix`, and an
    /// empty bare fork.
    fn fixture(contributor_content: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream");
        let contributor = dir.path().join("contributor");
        let fork = dir.path().join("fork.git");

        let up = init(&upstream, false);
        commit_file(&up, "a.txt", "one\n", "initial");

        let contrib = Repository::clone(upstream.to_str().unwrap(), &contributor).unwrap();
        checkout_new_branch(&contrib, "fix");
        commit_file(&contrib, "a.txt", contributor_content, "contributor change");

        init(&fork, true);

        let vcs = GitVcs::new(GitVcsSettings {
            mirror_dir: dir.path().join("mirror"),
            work_root: dir.path().join("work"),
            fork_url: fork.to_string_lossy().into_owned(),
            upstream_url: upstream.to_string_lossy().into_owned(),
            base_branch: "master".into(),
            committer_name: "r00tabot".into(),
            committer_email: "r00tabot@example.com".into(),
        });
        Fixture {
            _dir: dir,
            upstream,
            contributor,
            fork,
            vcs,
        }
    }

    fn file_on_branch(repo_path: &Path, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(repo_path).unwrap();
        let tree = repo
            .find_branch(branch, BranchType::Local)
            .ok()?
            .get()
            .peel_to_tree()
            .unwrap();
        let entry = tree.get_name(file)?;
        let blob = repo.find_blob(entry.id()).unwrap();
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }

    #[tokio::test]
    async fn test_sync_then_clean_merge_is_pushed() {
        let fx = fixture("two\n");
        fx.vcs.sync_fork().await.unwrap();
        assert_eq!(file_on_branch(&fx.fork, "master", "a.txt").as_deref(), Some("one\n"));

        let outcome = fx
            .vcs
            .merge_proposal("req-1", fx.contributor.to_str().unwrap(), "fix")
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);

        fx.vcs.push_branch("req-1").await.unwrap();
        assert_eq!(file_on_branch(&fx.fork, "req-1", "a.txt").as_deref(), Some("two\n"));
    }

    #[tokio::test]
    async fn test_conflict_is_reported_and_patch_fallback_commits() {
        let fx = fixture("contributor\n");
        let up = Repository::open(&fx.upstream).unwrap();
        commit_file(&up, "a.txt", "upstream\n", "diverge");
        fx.vcs.sync_fork().await.unwrap();

        let outcome = fx
            .vcs
            .merge_proposal("req-2", fx.contributor.to_str().unwrap(), "fix")
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Conflicted);

        let diff = "diff --git a/b.txt b/b.txt\nnew file mode 100644\n--- /dev/null\n+++ b/b.txt\n@@ -0,0 +1 @@\n+patched\n";
        fx.vcs.apply_patch("req-2", diff, "Port proposal").await.unwrap();
        fx.vcs.push_branch("req-2").await.unwrap();

        assert_eq!(file_on_branch(&fx.fork, "req-2", "b.txt").as_deref(), Some("patched\n"));
        assert_eq!(file_on_branch(&fx.fork, "req-2", "a.txt").as_deref(), Some("upstream\n"));
    }

    #[tokio::test]
    async fn test_sync_is_repeatable() {
        let fx = fixture("two\n");
        fx.vcs.sync_fork().await.unwrap();
        fx.vcs.sync_fork().await.unwrap();
        assert_eq!(file_on_branch(&fx.fork, "master", "a.txt").as_deref(), Some("one\n"));
    }
}
