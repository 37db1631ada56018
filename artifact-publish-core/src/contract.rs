//! # contract: data model and capability traits for artifact publication
//!
//! This module defines the plain data types that flow through the pipeline
//! (revisions, identities, artifacts, targets) and the two traits the core
//! depends on but does not implement itself:
//!
//! - [`Generator`]: produces one artifact file for a given [`ArtifactKind`].
//! - [`TargetRepository`]: a working copy of a downstream git repository that
//!   can be cloned, staged, committed, pushed and moved onto the remote tip.
//!
//! ## Mocking & Testing
//! Both traits are annotated for `mockall` so consumers can generate
//! deterministic mocks. The mocks are exported under the `test-export-mocks`
//! feature, so the CLI crate's tests can use them as well.
//! For stateful protocol tests see [`crate::fakes`], an in-memory remote.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GenerateError, RepoError};

/// The source revision that triggered the run. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRevision {
    /// Revision identifier (commit hash).
    pub id: String,
    pub author_name: String,
    pub author_email: String,
}

/// Author identity used for published commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Kinds of derived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// JSON schema of the event payload.
    Schema,
    /// Machine-readable documentation of emitted metrics.
    MetricsDoc,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Schema, ArtifactKind::MetricsDoc];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Schema => "schema",
            ArtifactKind::MetricsDoc => "metrics-doc",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(ArtifactKind::Schema),
            "metrics-doc" | "metrics_doc" => Ok(ArtifactKind::MetricsDoc),
            other => Err(format!(
                "unknown artifact kind '{other}', expected one of: schema, metrics-doc"
            )),
        }
    }
}

/// Where an artifact kind is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTarget {
    /// Git-addressable URL of the downstream repository.
    pub url: String,
    /// The single branch the publisher advances.
    pub branch: String,
    /// File path relative to the repository root.
    pub path: String,
    /// Name of the environment variable holding the push token, if any.
    #[serde(default)]
    pub token_env: Option<String>,
}

/// A freshly generated artifact, ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub repo_url: String,
    pub path: String,
    pub payload: Vec<u8>,
}

impl Artifact {
    /// Hex-encoded SHA-256 of the payload, used in reports and logs.
    pub fn digest(&self) -> String {
        payload_digest(&self.payload)
    }
}

pub fn payload_digest(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Result of committing the staged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new commit was created on top of the working copy's tip.
    Created { commit_id: String },
    /// The staged tree is identical to the parent commit; nothing was committed.
    Unchanged,
}

/// Result of a fast-forward-only push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The remote branch moved since the working copy was taken.
    Rejected,
}

/// Trait for producing one artifact file from the current source tree.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Generator: Send + Sync {
    /// Write the artifact for `kind` to `output_path`.
    async fn generate(&self, kind: ArtifactKind, output_path: &Path) -> Result<(), GenerateError>;
}

/// Working copy of a downstream repository, injected into the publisher.
///
/// Implemented by [`crate::git::GitRepository`] for real remotes and by
/// [`crate::fakes::MemoryRepository`] for tests. Implementations must never
/// force-push or rewrite the remote history.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Obtain a working copy at the current remote tip of the target branch.
    async fn clone_tip(&mut self) -> Result<(), RepoError>;

    /// Write `payload` to `path` (overwriting) and stage it for the next commit.
    async fn stage(&mut self, path: &str, payload: &[u8]) -> Result<(), RepoError>;

    /// True when the working copy's history already holds a commit whose
    /// message is exactly `message`.
    async fn has_commit_with_message(&mut self, message: &str) -> Result<bool, RepoError>;

    /// Commit the staged tree authored by `identity`.
    async fn commit(&mut self, identity: &Identity, message: &str)
        -> Result<CommitOutcome, RepoError>;

    /// Push the local tip to the target branch, fast-forward only.
    async fn push(&mut self) -> Result<PushOutcome, RepoError>;

    /// Fetch the remote tip and move the working copy onto it, dropping the
    /// unpublished local commit. The caller replays its change by restaging.
    async fn rebase_onto_remote(&mut self) -> Result<(), RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_kind_parses_and_displays() {
        assert_eq!("schema".parse::<ArtifactKind>(), Ok(ArtifactKind::Schema));
        assert_eq!(
            "metrics-doc".parse::<ArtifactKind>(),
            Ok(ArtifactKind::MetricsDoc)
        );
        assert_eq!(ArtifactKind::MetricsDoc.to_string(), "metrics-doc");
        assert!("docs".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn artifact_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&ArtifactKind::MetricsDoc).unwrap();
        assert_eq!(json, "\"metrics-doc\"");
        let back: ArtifactKind = serde_json::from_str("\"schema\"").unwrap();
        assert_eq!(back, ArtifactKind::Schema);
    }

    #[test]
    fn digest_is_content_addressed() {
        let a = payload_digest(br#"{"version":1}"#);
        let b = payload_digest(br#"{"version":1}"#);
        let c = payload_digest(br#"{"version":2}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
