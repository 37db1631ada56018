// Integration tests for the git-backed target repository.
// Each test creates a bare remote in a temp dir, seeds a `main` branch and
// publishes into it through `GitRepository`. Tests run serially because one
// of them sets git identity variables that every spawned `git` inherits.

use std::path::{Path, PathBuf};
use std::process::Command;

use artifact_publish_core::contract::{
    Artifact, ArtifactKind, ArtifactTarget, CommitOutcome, Identity, PushOutcome, SourceRevision,
    TargetRepository,
};
use artifact_publish_core::error::{PublishError, RepoError};
use artifact_publish_core::git::{read_source_revision, GitRepository};
use artifact_publish_core::publisher::{publish, PublishOptions, PublishOutcome};
use async_trait::async_trait;
use serial_test::serial;
use tempfile::TempDir;

const PATH: &str = "relay/event.schema.json";

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn commit_as(dir: &Path, name: &str, email: &str, message: &str) {
    let user_name = format!("user.name={name}");
    let user_email = format!("user.email={email}");
    git(
        dir,
        &[
            "-c", &user_name, "-c", &user_email, "commit", "--quiet", "-m", message,
        ],
    );
}

/// Bare remote with a `main` branch holding a README.
fn make_remote() -> (TempDir, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let remote = root.path().join("remote.git");
    git(
        root.path(),
        &["init", "--quiet", "--bare", remote.to_str().unwrap()],
    );

    let seed = root.path().join("seed");
    std::fs::create_dir(&seed).unwrap();
    git(&seed, &["init", "--quiet"]);
    std::fs::write(seed.join("README.md"), "downstream\n").unwrap();
    git(&seed, &["add", "README.md"]);
    commit_as(&seed, "Seed", "seed@example.com", "initial");
    git(
        &seed,
        &[
            "push",
            "--quiet",
            remote.to_str().unwrap(),
            "HEAD:refs/heads/main",
        ],
    );
    (root, remote)
}

fn remote_git(remote: &Path, args: &[&str]) -> String {
    let git_dir = format!("--git-dir={}", remote.display());
    let mut full = vec![git_dir.as_str()];
    full.extend_from_slice(args);
    git(remote.parent().unwrap(), &full)
}

fn commit_count(remote: &Path) -> usize {
    remote_git(remote, &["rev-list", "--count", "main"])
        .parse()
        .unwrap()
}

/// Push a commit to `main` from an independent clone, as a competing run would.
fn push_competing_commit(remote: &Path, file: &str, content: &str) {
    let dir = tempfile::tempdir().unwrap();
    git(
        dir.path(),
        &[
            "clone",
            "--quiet",
            "--branch",
            "main",
            remote.to_str().unwrap(),
            "work",
        ],
    );
    let work = dir.path().join("work");
    if let Some(parent) = work.join(file).parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(work.join(file), content).unwrap();
    git(&work, &["add", file]);
    commit_as(&work, "Bob", "bob@example.com", "competing write");
    git(&work, &["push", "--quiet", "origin", "HEAD:refs/heads/main"]);
}

fn target(remote: &Path, branch: &str) -> ArtifactTarget {
    ArtifactTarget {
        url: remote.to_str().unwrap().to_string(),
        branch: branch.to_string(),
        path: PATH.to_string(),
        token_env: None,
    }
}

fn fixture(remote: &Path, payload: &[u8]) -> (Artifact, Identity, SourceRevision) {
    (
        Artifact {
            kind: ArtifactKind::Schema,
            repo_url: remote.display().to_string(),
            path: PATH.into(),
            payload: payload.to_vec(),
        },
        Identity {
            name: "Alice".into(),
            email: "alice@example.com".into(),
        },
        SourceRevision {
            id: "abc123".into(),
            author_name: "Alice".into(),
            author_email: "alice@example.com".into(),
        },
    )
}

#[tokio::test]
#[serial]
async fn publishes_attributed_commit_and_rerun_is_no_op() {
    let (_root, remote) = make_remote();
    let (artifact, identity, revision) = fixture(&remote, br#"{"version":1}"#);
    let options = PublishOptions::default();

    let mut repo = GitRepository::new(target(&remote, "main"), None);
    let report = publish(&mut repo, &artifact, &identity, &revision, &options)
        .await
        .expect("publish should succeed");
    assert!(matches!(report.outcome, PublishOutcome::Pushed { .. }));

    let meta = remote_git(&remote, &["log", "-1", "--format=%an%n%ae%n%s", "main"]);
    assert_eq!(meta, "Alice\nalice@example.com\ngetsentry/relay@abc123");
    let content = remote_git(&remote, &["show", &format!("main:{PATH}")]);
    assert_eq!(content, r#"{"version":1}"#);
    assert_eq!(commit_count(&remote), 2);

    let mut repo = GitRepository::new(target(&remote, "main"), None);
    let report = publish(&mut repo, &artifact, &identity, &revision, &options)
        .await
        .expect("re-run should succeed");
    assert_eq!(report.outcome, PublishOutcome::NoOp);
    assert_eq!(commit_count(&remote), 2, "no new commit on identical content");
}

const IDENTITY_VARS: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "ci-bot"),
    ("GIT_AUTHOR_EMAIL", "ci-bot@example.com"),
    ("GIT_COMMITTER_NAME", "ci-bot"),
    ("GIT_COMMITTER_EMAIL", "ci-bot@example.com"),
];

#[tokio::test]
#[serial]
async fn revision_author_wins_over_ambient_git_identity() {
    let (_root, remote) = make_remote();
    let (artifact, identity, revision) = fixture(&remote, br#"{"version":1}"#);

    for (key, value) in IDENTITY_VARS {
        std::env::set_var(key, value);
    }
    let mut repo = GitRepository::new(target(&remote, "main"), None);
    let result = publish(
        &mut repo,
        &artifact,
        &identity,
        &revision,
        &PublishOptions::default(),
    )
    .await;
    for (key, _) in IDENTITY_VARS {
        std::env::remove_var(key);
    }

    let report = result.expect("publish should succeed");
    assert!(matches!(report.outcome, PublishOutcome::Pushed { .. }));
    let meta = remote_git(&remote, &["log", "-1", "--format=%an%n%ae%n%cn%n%ce", "main"]);
    assert_eq!(
        meta,
        "Alice\nalice@example.com\nAlice\nalice@example.com"
    );
}

#[tokio::test]
#[serial]
async fn older_revision_is_not_republished_over_newer_content() {
    let (_root, remote) = make_remote();
    let (artifact, identity, revision) = fixture(&remote, br#"{"version":1}"#);
    let options = PublishOptions::default();

    let mut repo = GitRepository::new(target(&remote, "main"), None);
    publish(&mut repo, &artifact, &identity, &revision, &options)
        .await
        .expect("first publish should succeed");

    let newer = SourceRevision {
        id: "def456".into(),
        ..revision.clone()
    };
    let newer_artifact = Artifact {
        payload: br#"{"version":2}"#.to_vec(),
        ..artifact.clone()
    };
    let mut repo = GitRepository::new(target(&remote, "main"), None);
    publish(&mut repo, &newer_artifact, &identity, &newer, &options)
        .await
        .expect("newer publish should succeed");
    assert_eq!(commit_count(&remote), 3);

    let mut repo = GitRepository::new(target(&remote, "main"), None);
    let report = publish(&mut repo, &artifact, &identity, &revision, &options)
        .await
        .expect("rerun should succeed");
    assert_eq!(report.outcome, PublishOutcome::NoOp);
    assert_eq!(report.push_attempts, 0);
    assert_eq!(commit_count(&remote), 3);
    assert_eq!(
        remote_git(&remote, &["show", &format!("main:{PATH}")]),
        r#"{"version":2}"#
    );
}

/// Delegates to a real working copy but lets a competitor win the first push.
struct RacingRepository {
    inner: GitRepository,
    remote: PathBuf,
    raced: bool,
    pushes: u32,
}

#[async_trait]
impl TargetRepository for RacingRepository {
    async fn clone_tip(&mut self) -> Result<(), RepoError> {
        self.inner.clone_tip().await
    }

    async fn stage(&mut self, path: &str, payload: &[u8]) -> Result<(), RepoError> {
        self.inner.stage(path, payload).await
    }

    async fn has_commit_with_message(&mut self, message: &str) -> Result<bool, RepoError> {
        self.inner.has_commit_with_message(message).await
    }

    async fn commit(
        &mut self,
        identity: &Identity,
        message: &str,
    ) -> Result<CommitOutcome, RepoError> {
        self.inner.commit(identity, message).await
    }

    async fn push(&mut self) -> Result<PushOutcome, RepoError> {
        if !self.raced {
            self.raced = true;
            push_competing_commit(&self.remote, "CHANGELOG.md", "competitor\n");
        }
        self.pushes += 1;
        self.inner.push().await
    }

    async fn rebase_onto_remote(&mut self) -> Result<(), RepoError> {
        self.inner.rebase_onto_remote().await
    }
}

#[tokio::test]
#[serial]
async fn rejected_push_is_rebased_and_retried() {
    let (_root, remote) = make_remote();
    let before = remote_git(&remote, &["rev-parse", "main"]);
    let (artifact, identity, revision) = fixture(&remote, br#"{"version":2}"#);

    let mut repo = RacingRepository {
        inner: GitRepository::new(target(&remote, "main"), None),
        remote: remote.clone(),
        raced: false,
        pushes: 0,
    };
    let report = publish(
        &mut repo,
        &artifact,
        &identity,
        &revision,
        &PublishOptions::default(),
    )
    .await
    .expect("publish should recover from the race");

    assert!(matches!(report.outcome, PublishOutcome::Pushed { .. }));
    assert_eq!(report.push_attempts, 2);
    assert_eq!(repo.pushes, 2);

    // Linear history: seed, competitor, ours.
    assert_eq!(commit_count(&remote), 3);
    let subjects = remote_git(&remote, &["log", "--format=%s", "main"]);
    assert_eq!(
        subjects,
        "getsentry/relay@abc123\ncompeting write\ninitial"
    );
    let merges = remote_git(&remote, &["rev-list", "--merges", "--count", "main"]);
    assert_eq!(merges, "0");

    // Fast-forward only: the old tip is still an ancestor.
    git(
        remote.parent().unwrap(),
        &[
            &format!("--git-dir={}", remote.display()),
            "merge-base",
            "--is-ancestor",
            &before,
            "main",
        ],
    );

    // Both writes survive.
    assert_eq!(
        remote_git(&remote, &["show", "main:CHANGELOG.md"]),
        "competitor"
    );
    assert_eq!(
        remote_git(&remote, &["show", &format!("main:{PATH}")]),
        r#"{"version":2}"#
    );
}

#[tokio::test]
#[serial]
async fn missing_branch_is_a_fatal_clone_error() {
    let (_root, remote) = make_remote();
    let (artifact, identity, revision) = fixture(&remote, b"{}");

    let mut repo = GitRepository::new(target(&remote, "does-not-exist"), None);
    let err = publish(
        &mut repo,
        &artifact,
        &identity,
        &revision,
        &PublishOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PublishError::Clone(_)), "got {err:?}");
    assert_eq!(commit_count(&remote), 1);
}

#[tokio::test]
#[serial]
async fn operations_before_clone_fail() {
    let (_root, remote) = make_remote();
    let mut repo = GitRepository::new(target(&remote, "main"), None);
    assert!(matches!(
        repo.stage(PATH, b"{}").await,
        Err(RepoError::NotCloned)
    ));
    assert!(repo.workdir().is_none());
}

#[tokio::test]
#[serial]
async fn reads_author_metadata_of_revision() {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "--quiet"]);
    std::fs::write(dir.path().join("lib.rs"), "// relay\n").unwrap();
    git(dir.path(), &["add", "lib.rs"]);
    commit_as(dir.path(), "Alice Liddell", "alice@example.com", "feat: things");
    let head = git(dir.path(), &["rev-parse", "HEAD"]);

    let revision = read_source_revision(dir.path(), "HEAD").await.unwrap();
    assert_eq!(revision.id, head);
    assert_eq!(revision.author_name, "Alice Liddell");
    assert_eq!(revision.author_email, "alice@example.com");

    assert!(read_source_revision(dir.path(), "no-such-rev").await.is_err());
}
