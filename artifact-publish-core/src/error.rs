//! Error types for generation, git access, identity resolution and publication.

use std::path::PathBuf;

use thiserror::Error;

use crate::contract::ArtifactKind;

/// Failure of a single git operation against a working copy.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("failed to launch git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("working copy has not been cloned yet")]
    NotCloned,

    #[error("unexpected git output: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of an artifact generator.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no generator command configured for {0}")]
    NotConfigured(ArtifactKind),

    #[error("generator command for {0} is empty")]
    EmptyCommand(ArtifactKind),

    #[error("failed to launch generator {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator for {kind} exited with {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    Failed { kind: ArtifactKind, code: Option<i32> },

    #[error("generator for {kind} did not produce {}", .path.display())]
    MissingOutput { kind: ArtifactKind, path: PathBuf },
}

/// Missing or unusable author metadata. Never papered over with a default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("no source revision metadata available")]
    MissingRevision,

    #[error("revision {revision} has no author name")]
    MissingName { revision: String },

    #[error("revision {revision} has no author email")]
    MissingEmail { revision: String },

    #[error("revision {revision} has an invalid author email '{email}'")]
    InvalidEmail { revision: String, email: String },
}

/// Fatal outcome of one publish operation. Contention never surfaces here
/// unless the retry budget ran out.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("could not obtain a working copy of the target: {0}")]
    Clone(#[source] RepoError),

    #[error("git failure while {state}: {source}")]
    Repository {
        state: &'static str,
        #[source]
        source: RepoError,
    },

    #[error("push rejected {attempts} times, giving up")]
    Exhausted { attempts: u32 },
}

/// Per-kind failure recorded by the pipeline driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("generation failed: {0}")]
    Generate(#[from] GenerateError),

    #[error("cannot attribute commit: {0}")]
    Identity(#[from] IdentityError),

    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("failed to prepare generator output: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed to read generated artifact {}: {source}", .path.display())]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Publish(#[from] PublishError),
}
