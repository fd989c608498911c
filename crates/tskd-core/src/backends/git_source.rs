//! Git-backed `ReadFileAtRef`, `Syncer`, and `CodeReview`.
//!
//! Each repo known to the scheduler is mirrored as a local bare clone
//! under `mirror_root`, fetched lazily on first access and thereafter
//! refreshed once per call (git's own packfile negotiation makes a
//! no-op fetch cheap). Code-review patches are resolved through the
//! Gerrit ref convention (`refs/changes/<issue % 100>/<issue>/<patchset>`)
//! fetched straight from the same remote -- no separate review-host
//! client is needed because Gerrit serves patchsets as ordinary git
//! refs.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::external::{CodeReview, ExternalError, ReadFileAtRef, Syncer, WorktreeHandle};

/// Where mirrors and scratch worktrees live, and how a `repo` name (e.g.
/// `chromium/src`) maps to a fetchable remote URL.
#[derive(Debug, Clone)]
pub struct GitRepoBackendConfig {
    pub mirror_root: PathBuf,
    pub worktree_root: PathBuf,
    /// Prefix joined with `repo` to form the remote URL, e.g.
    /// `https://chromium.googlesource.com` + `/chromium/src`.
    pub remote_base: String,
}

/// Shared git plumbing for the three traits above. Git serializes its
/// own lock-file access per repo, but two concurrent fetches into the
/// same mirror can still race each other's packed-refs update, so all
/// mutating operations against one mirror go through `git_lock`.
pub struct GitRepoBackend {
    config: GitRepoBackendConfig,
    git_lock: Mutex<()>,
    /// Mirror most recently touched by `read_file_at_ref`/`sync`.
    /// `CodeReview`'s narrow `(issue, patchset) -> diff` contract (§1)
    /// carries no repo, so a patch lookup reuses whichever mirror the
    /// Cacher just resolved the pipeline file from -- true in practice
    /// since `TasksCfgCacher::resolve` always reads the tip file before
    /// asking `CodeReview` about the same `RepoState`.
    last_mirror: Mutex<Option<PathBuf>>,
}

impl GitRepoBackend {
    pub fn new(config: GitRepoBackendConfig) -> Self {
        Self {
            config,
            git_lock: Mutex::new(()),
            last_mirror: Mutex::new(None),
        }
    }

    fn mirror_path(&self, repo: &str) -> PathBuf {
        self.config.mirror_root.join(sanitize(repo))
    }

    fn remote_url(&self, repo: &str) -> String {
        format!("{}/{}", self.config.remote_base.trim_end_matches('/'), repo)
    }

    /// Ensure a bare mirror of `repo` exists and is up to date, returning
    /// its path. Runs under `git_lock` since clone/fetch both mutate the
    /// mirror's ref database.
    fn ensure_mirror(&self, repo: &str) -> Result<PathBuf, ExternalError> {
        let _guard = self.git_lock.lock().expect("git mirror lock poisoned");
        let path = self.mirror_path(repo);

        if !path.join("HEAD").exists() {
            std::fs::create_dir_all(&path)
                .map_err(|e| ExternalError::Transient(format!("failed to create mirror dir: {e}")))?;
            run_git(
                Path::new("."),
                &["clone", "--bare", &self.remote_url(repo), path.to_string_lossy().as_ref()],
            )?;
        } else {
            run_git(&path, &["fetch", "origin", "+refs/heads/*:refs/heads/*"])?;
        }

        *self.last_mirror.lock().expect("last_mirror lock poisoned") = Some(path.clone());
        Ok(path)
    }

    fn fetch_ref(&self, mirror: &Path, git_ref: &str) -> Result<(), ExternalError> {
        let _guard = self.git_lock.lock().expect("git mirror lock poisoned");
        run_git(mirror, &["fetch", "origin", &format!("+{git_ref}:{git_ref}")])
    }

    fn current_mirror(&self) -> Result<PathBuf, ExternalError> {
        self.last_mirror
            .lock()
            .expect("last_mirror lock poisoned")
            .clone()
            .ok_or_else(|| {
                ExternalError::Permanent(
                    "no mirror synced yet; read_file_at_ref must run before get_patch".into(),
                )
            })
    }
}

fn sanitize(repo: &str) -> String {
    repo.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Gerrit's own convention for addressing a patchset as a git ref.
fn gerrit_ref(issue: &str, patchset: &str) -> Result<String, ExternalError> {
    let issue_num: u64 = issue
        .parse()
        .map_err(|_| ExternalError::Permanent(format!("not a numeric issue: {issue}")))?;
    Ok(format!("refs/changes/{:02}/{issue_num}/{patchset}", issue_num % 100))
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<Output, ExternalError> {
    debug!(?cwd, ?args, "running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| ExternalError::Transient(format!("failed to spawn git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(classify_git_failure(args, &stderr));
    }
    Ok(output)
}

fn classify_git_failure(args: &[&str], stderr: &str) -> ExternalError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("does not exist")
        || lower.contains("unknown revision")
        || lower.contains("bad object")
        || lower.contains("couldn't find remote ref")
    {
        ExternalError::NotFound(format!("git {}: {stderr}", args.join(" ")))
    } else if lower.contains("could not resolve host") || lower.contains("connection") {
        ExternalError::Transient(format!("git {}: {stderr}", args.join(" ")))
    } else {
        ExternalError::Permanent(format!("git {}: {stderr}", args.join(" ")))
    }
}

#[async_trait]
impl ReadFileAtRef for GitRepoBackend {
    async fn read_file_at_ref(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<u8>, ExternalError> {
        let mirror = self.ensure_mirror(repo)?;
        let output = run_git(&mirror, &["cat-file", "-p", &format!("{git_ref}:{path}")])?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl Syncer for GitRepoBackend {
    async fn sync(
        &self,
        repo: &str,
        revision: &str,
        patch_issue: Option<&str>,
        patch_patchset: Option<&str>,
    ) -> Result<WorktreeHandle, ExternalError> {
        let mirror = self.ensure_mirror(repo)?;

        let scratch_name = format!(
            "{}-{}-{}",
            sanitize(repo),
            revision,
            patch_issue.unwrap_or("nopatch")
        );
        let worktree_path = self.config.worktree_root.join(scratch_name);
        if worktree_path.exists() {
            std::fs::remove_dir_all(&worktree_path).map_err(|e| {
                ExternalError::Transient(format!("failed to clear stale worktree: {e}"))
            })?;
        }
        std::fs::create_dir_all(&self.config.worktree_root)
            .map_err(|e| ExternalError::Transient(format!("failed to create worktree root: {e}")))?;

        run_git(
            &mirror,
            &[
                "worktree",
                "add",
                "--detach",
                "--force",
                worktree_path.to_string_lossy().as_ref(),
                revision,
            ],
        )?;

        if let (Some(issue), Some(patchset)) = (patch_issue, patch_patchset) {
            let change_ref = gerrit_ref(issue, patchset)?;
            self.fetch_ref(&mirror, &change_ref)?;
            let applied = run_git(
                &worktree_path,
                &["cherry-pick", "--no-commit", "-X", "theirs", "FETCH_HEAD"],
            );
            if applied.is_err() {
                run_git(&worktree_path, &["cherry-pick", "--abort"]).ok();
                return Err(ExternalError::PatchRejected(format!(
                    "patch {issue}/{patchset} does not apply to {revision}"
                )));
            }
        }

        Ok(WorktreeHandle { path: worktree_path })
    }
}

#[async_trait]
impl CodeReview for GitRepoBackend {
    async fn get_changed_files(
        &self,
        issue: &str,
        patchset: &str,
    ) -> Result<Vec<String>, ExternalError> {
        let diff = self.patchset_diff(issue, patchset, &["--name-only"])?;
        Ok(String::from_utf8_lossy(&diff)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    async fn get_patch(
        &self,
        issue: &str,
        patchset: &str,
        path: &str,
    ) -> Result<Vec<u8>, ExternalError> {
        self.patchset_diff(issue, patchset, &["--", path])
    }
}

impl GitRepoBackend {
    /// Diffs a Gerrit patchset commit against its own parent, since
    /// Gerrit uploads each patchset as a single commit on top of the
    /// revision it was written against.
    fn patchset_diff(
        &self,
        issue: &str,
        patchset: &str,
        extra_args: &[&str],
    ) -> Result<Vec<u8>, ExternalError> {
        let mirror = self.current_mirror()?;
        let change_ref = gerrit_ref(issue, patchset)?;
        self.fetch_ref(&mirror, &change_ref)?;

        let mut args = vec!["diff", "FETCH_HEAD^..FETCH_HEAD"];
        args.extend_from_slice(extra_args);
        let output = run_git(&mirror, &args)?;
        Ok(output.stdout)
    }
}
