//! Git-backed [`TargetRepository`] and helpers for reading source revisions.
//!
//! All operations shell out to the `git` binary. The working copy lives in a
//! temporary directory owned by [`GitRepository`] and is removed on drop.
//! Pushes are always `HEAD:refs/heads/<branch>` without `--force`, so the
//! remote only ever fast-forwards.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tempfile::TempDir;
use tokio::process::Command;

use crate::contract::{CommitOutcome, Identity, PushOutcome, SourceRevision, TargetRepository};
use crate::contract::ArtifactTarget;
use crate::error::RepoError;

/// Working copy of one target repository branch.
pub struct GitRepository {
    target: ArtifactTarget,
    token: Option<String>,
    checkout: Option<TempDir>,
}

impl GitRepository {
    pub fn new(target: ArtifactTarget, token: Option<String>) -> Self {
        Self {
            target,
            token,
            checkout: None,
        }
    }

    /// Path of the cloned working copy, once [`TargetRepository::clone_tip`] succeeded.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.checkout.as_ref().map(|dir| dir.path().join("repo"))
    }

    fn repo_path(&self) -> Result<PathBuf, RepoError> {
        self.workdir().ok_or(RepoError::NotCloned)
    }

    fn remote_url(&self) -> String {
        match &self.token {
            Some(token) => authenticated_url(&self.target.url, token),
            None => self.target.url.clone(),
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    async fn git<I, S>(&self, dir: &Path, args: I) -> Result<Output, RepoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        git_output(Some(dir), args).await
    }

    /// Runs git and maps a non-zero exit to [`RepoError::Command`].
    async fn git_checked(&self, dir: &Path, args: &[&str]) -> Result<Output, RepoError> {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            return Err(RepoError::Command {
                command: subcommand(args).to_string(),
                stderr: self.redact(String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        Ok(output)
    }

    async fn head(&self, dir: &Path) -> Result<String, RepoError> {
        let output = self.git_checked(dir, &["rev-parse", "HEAD"]).await?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            return Err(RepoError::Malformed("git rev-parse HEAD returned empty output".into()));
        }
        Ok(sha)
    }
}

#[async_trait]
impl TargetRepository for GitRepository {
    async fn clone_tip(&mut self) -> Result<(), RepoError> {
        let dir = tempfile::Builder::new().prefix("artifact-publish-").tempdir()?;
        let checkout = dir.path().join("repo");

        tracing::info!(
            repo_url = %self.target.url,
            branch = %self.target.branch,
            path = %checkout.display(),
            "[GIT] Cloning target repository"
        );

        let output = git_output(
            None,
            [
                OsStr::new("clone"),
                OsStr::new("--quiet"),
                OsStr::new("--single-branch"),
                OsStr::new("--branch"),
                OsStr::new(&self.target.branch),
                OsStr::new(&self.remote_url()),
                checkout.as_os_str(),
            ],
        )
        .await?;

        if !output.status.success() {
            let stderr = self.redact(String::from_utf8_lossy(&output.stderr).trim());
            tracing::error!(
                repo_url = %self.target.url,
                branch = %self.target.branch,
                stderr = %stderr,
                "[GIT] Clone failed"
            );
            return Err(RepoError::Command {
                command: "clone".into(),
                stderr,
            });
        }

        // The TempDir owns the clone and removes it on drop.
        self.checkout = Some(dir);
        Ok(())
    }

    async fn stage(&mut self, path: &str, payload: &[u8]) -> Result<(), RepoError> {
        let repo = self.repo_path()?;
        let file = repo.join(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, payload).await?;
        self.git_checked(&repo, &["add", "--", path]).await?;
        tracing::debug!(path, bytes = payload.len(), "[GIT] Staged artifact");
        Ok(())
    }

    async fn has_commit_with_message(&mut self, message: &str) -> Result<bool, RepoError> {
        let repo = self.repo_path()?;
        let grep = format!("--grep={message}");
        let output = self
            .git_checked(
                &repo,
                &["log", "--fixed-strings", grep.as_str(), "--format=%B%x00", "HEAD"],
            )
            .await?;
        // --grep matches substrings of any line; require the whole message.
        let found = String::from_utf8_lossy(&output.stdout)
            .split('\0')
            .any(|body| body.trim() == message);
        if found {
            tracing::info!(message, "[GIT] Target history already holds this revision");
        }
        Ok(found)
    }

    async fn commit(
        &mut self,
        identity: &Identity,
        message: &str,
    ) -> Result<CommitOutcome, RepoError> {
        let repo = self.repo_path()?;

        // `diff --cached --quiet` exits 0 when the index matches HEAD.
        let diff = self.git(&repo, ["diff", "--cached", "--quiet"]).await?;
        match diff.status.code() {
            Some(0) => {
                tracing::info!("[GIT] Staged content identical to tip, nothing to commit");
                return Ok(CommitOutcome::Unchanged);
            }
            Some(1) => {}
            _ => {
                return Err(RepoError::Command {
                    command: "diff".into(),
                    stderr: String::from_utf8_lossy(&diff.stderr).trim().to_string(),
                })
            }
        }

        // Identity env vars outrank `user.*` config, so set them all explicitly.
        let env = [
            ("GIT_AUTHOR_NAME", identity.name.as_str()),
            ("GIT_AUTHOR_EMAIL", identity.email.as_str()),
            ("GIT_COMMITTER_NAME", identity.name.as_str()),
            ("GIT_COMMITTER_EMAIL", identity.email.as_str()),
        ];
        let args = ["commit", "--quiet", "--no-verify", "-m", message];
        let output = git_output_with_env(Some(&repo), args, &env).await?;
        if !output.status.success() {
            return Err(RepoError::Command {
                command: "commit".into(),
                stderr: self.redact(String::from_utf8_lossy(&output.stderr).trim()),
            });
        }

        let commit_id = self.head(&repo).await?;
        tracing::info!(commit_id = %commit_id, author = %identity.email, "[GIT] Created commit");
        Ok(CommitOutcome::Created { commit_id })
    }

    async fn push(&mut self) -> Result<PushOutcome, RepoError> {
        let repo = self.repo_path()?;
        let refspec = format!("HEAD:refs/heads/{}", self.target.branch);
        let output = self
            .git(&repo, ["push", "--porcelain", "origin", refspec.as_str()])
            .await?;

        if output.status.success() {
            tracing::info!(branch = %self.target.branch, "[GIT] Push accepted");
            return Ok(PushOutcome::Accepted);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_non_fast_forward(&stdout) || is_non_fast_forward(&stderr) {
            tracing::warn!(branch = %self.target.branch, "[GIT] Push rejected, remote has moved");
            return Ok(PushOutcome::Rejected);
        }

        Err(RepoError::Command {
            command: "push".into(),
            stderr: self.redact(format!("{} {}", stdout.trim(), stderr.trim()).trim()),
        })
    }

    async fn rebase_onto_remote(&mut self) -> Result<(), RepoError> {
        let repo = self.repo_path()?;
        let branch = self.target.branch.clone();
        self.git_checked(&repo, &["fetch", "--quiet", "origin", branch.as_str()])
            .await?;
        self.git_checked(&repo, &["reset", "--quiet", "--hard", "FETCH_HEAD"])
            .await?;
        let tip = self.head(&repo).await?;
        tracing::info!(branch = %branch, tip = %tip, "[GIT] Moved working copy onto remote tip");
        Ok(())
    }
}

/// Read author metadata of `rev` from the git checkout at `repo_dir`.
pub async fn read_source_revision(repo_dir: &Path, rev: &str) -> Result<SourceRevision, RepoError> {
    let output = git_output(
        Some(repo_dir),
        ["log", "-1", "--format=%H%n%an%n%ae", rev, "--"],
    )
    .await?;
    if !output.status.success() {
        return Err(RepoError::Command {
            command: "log".into(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    match (lines.next(), lines.next(), lines.next()) {
        (Some(id), Some(name), Some(email)) if !id.trim().is_empty() => Ok(SourceRevision {
            id: id.trim().to_string(),
            author_name: name.to_string(),
            author_email: email.to_string(),
        }),
        _ => Err(RepoError::Malformed(format!(
            "git log for {rev} returned: {stdout:?}"
        ))),
    }
}

/// Embed a push token into an `https://` URL. Other schemes are returned as-is.
pub fn authenticated_url(url: &str, token: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) => {
            // Drop any credentials already present in the URL.
            let host_and_path = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
            format!("https://x-access-token:{token}@{host_and_path}")
        }
        None => url.to_string(),
    }
}

/// True when git reported a non-fast-forward rejection (`[rejected]`), as
/// opposed to a hook or permission failure (`[remote rejected]`).
pub fn is_non_fast_forward(output: &str) -> bool {
    static REJECTED: OnceLock<Regex> = OnceLock::new();
    REJECTED
        .get_or_init(|| Regex::new(r"(^|[\s!])\[rejected\]").expect("static regex"))
        .is_match(output)
}

/// First argument that names a git subcommand, skipping `-c key=value` pairs.
fn subcommand<'a>(args: &[&'a str]) -> &'a str {
    args.iter()
        .copied()
        .find(|arg| !arg.starts_with('-') && !arg.contains('='))
        .unwrap_or("git")
}

async fn git_output<I, S>(dir: Option<&Path>, args: I) -> Result<Output, RepoError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    git_output_with_env(dir, args, &[]).await
}

async fn git_output_with_env<I, S>(
    dir: Option<&Path>,
    args: I,
    env: &[(&str, &str)],
) -> Result<Output, RepoError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new("git");
    command.args(args);
    command.envs(env.iter().copied());
    // Never block on a credential prompt in CI.
    command.env("GIT_TERMINAL_PROMPT", "0");
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command.output().await.map_err(RepoError::Spawn)
}
