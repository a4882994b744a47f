//! Repo checkout via cached bare mirror + detached worktree.
//!
//! Layout under the cache root:
//! - `repos_cache/<owner__name>.git` — bare mirror, fetched on reuse
//! - `worktrees/<owner__name>/<commit>/` — detached worktree per commit
//!
//! Existing worktrees are verified against the expected commit and
//! recreated on mismatch.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::util::repo_to_dirname;

/// Result type alias for checkout operations.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Error during a mirror or worktree operation.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The git executable could not be spawned.
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    /// A git command exited non-zero.
    #[error("git {operation} failed: {stderr}")]
    Git { operation: String, stderr: String },

    /// Filesystem error while managing worktrees.
    #[error("checkout IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mirror + worktree cache rooted at one directory.
pub struct RepoCache {
    mirrors_dir: PathBuf,
    worktrees_dir: PathBuf,
}

impl RepoCache {
    /// Create a cache under `root` (`root/repos_cache`, `root/worktrees`).
    pub fn new(root: &Path) -> Self {
        Self {
            mirrors_dir: root.join("repos_cache"),
            worktrees_dir: root.join("worktrees"),
        }
    }

    /// Check out `repo` at `commit`, returning the worktree path.
    pub async fn checkout(&self, repo: &str, commit: &str) -> CheckoutResult<PathBuf> {
        let mirror = self.ensure_mirror(repo).await?;
        self.ensure_worktree(&mirror, repo, commit).await
    }

    async fn ensure_mirror(&self, repo: &str) -> CheckoutResult<PathBuf> {
        let mirror = self
            .mirrors_dir
            .join(format!("{}.git", repo_to_dirname(repo)));

        if mirror.exists() {
            // Refresh; a stale mirror only matters if the commit is new.
            if let Err(err) = run_git(&["fetch", "--all"], Some(&mirror)).await {
                warn!(repo, %err, "mirror fetch failed, continuing with cached refs");
            }
            return Ok(mirror);
        }

        std::fs::create_dir_all(&self.mirrors_dir)?;
        let url = format!("https://github.com/{repo}.git");
        debug!(repo, "cloning bare mirror");
        run_git(
            &["clone", "--mirror", &url, &mirror.to_string_lossy()],
            None,
        )
        .await?;
        Ok(mirror)
    }

    async fn ensure_worktree(
        &self,
        mirror: &Path,
        repo: &str,
        commit: &str,
    ) -> CheckoutResult<PathBuf> {
        let worktree = self.worktrees_dir.join(repo_to_dirname(repo)).join(commit);

        if worktree.exists() {
            if let Ok(head) = run_git(&["rev-parse", "HEAD"], Some(&worktree)).await {
                let short = &commit[..commit.len().min(7)];
                if head.starts_with(short) {
                    return Ok(worktree);
                }
            }
            // HEAD mismatch: remove and recreate.
            let _ = run_git(
                &["worktree", "remove", "--force", &worktree.to_string_lossy()],
                Some(mirror),
            )
            .await;
            if worktree.exists() {
                std::fs::remove_dir_all(&worktree)?;
            }
        }

        if let Some(parent) = worktree.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_git(
            &[
                "worktree",
                "add",
                "--detach",
                &worktree.to_string_lossy(),
                commit,
            ],
            Some(mirror),
        )
        .await?;
        Ok(worktree)
    }
}

/// Run a git command, returning trimmed stdout on success.
async fn run_git(args: &[&str], cwd: Option<&Path>) -> CheckoutResult<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd.output().await.map_err(CheckoutError::Spawn)?;

    if !output.status.success() {
        return Err(CheckoutError::Git {
            operation: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cache_layout() {
        let root = tempdir().unwrap();
        let cache = RepoCache::new(root.path());
        assert!(cache.mirrors_dir.ends_with("repos_cache"));
        assert!(cache.worktrees_dir.ends_with("worktrees"));
    }

    #[tokio::test]
    async fn test_run_git_reports_failure() {
        let dir = tempdir().unwrap();
        // rev-parse outside a repo fails with a Git error, not a panic.
        let err = run_git(&["rev-parse", "HEAD"], Some(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Git { .. }));
    }

    #[tokio::test]
    async fn test_checkout_local_repo_roundtrip() {
        // Build a tiny real repo, mirror it by path, and check out HEAD.
        let src = tempdir().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@t"],
            vec!["config", "user.name", "t"],
        ] {
            run_git(&args, Some(src.path())).await.unwrap();
        }
        std::fs::write(src.path().join("f.txt"), "hello").unwrap();
        run_git(&["add", "."], Some(src.path())).await.unwrap();
        run_git(&["commit", "-m", "init"], Some(src.path()))
            .await
            .unwrap();
        let head = run_git(&["rev-parse", "HEAD"], Some(src.path()))
            .await
            .unwrap();

        let root = tempdir().unwrap();
        let cache = RepoCache::new(root.path());
        // Seed the mirror manually so no network is involved.
        std::fs::create_dir_all(&cache.mirrors_dir).unwrap();
        let mirror = cache.mirrors_dir.join("local__repo.git");
        run_git(
            &[
                "clone",
                "--mirror",
                &src.path().to_string_lossy(),
                &mirror.to_string_lossy(),
            ],
            None,
        )
        .await
        .unwrap();

        let worktree = cache.checkout("local/repo", &head).await.unwrap();
        assert!(worktree.join("f.txt").exists());

        // Second checkout reuses the verified worktree.
        let again = cache.checkout("local/repo", &head).await.unwrap();
        assert_eq!(worktree, again);
    }
}
