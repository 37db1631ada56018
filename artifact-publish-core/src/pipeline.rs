//! High-level pipeline: orchestrates generate → publish for every artifact kind.
//!
//! This module provides the top-level orchestration for one run:
//!   - Generates each configured artifact kind into a fresh temporary file
//!   - On the mainline ref, publishes the artifact via [`crate::publisher::publish`]
//!   - On any other ref, stops after generation (dry run) and never opens a repository
//!   - Aggregates a [`PipelineReport`] with one entry per kind
//!
//! # Major Types
//! - [`PipelineConfig`]: mainline ref, publish options and the per-kind targets
//! - [`RunContext`]: the triggering ref and revision
//! - [`PipelineReport`]: per-kind outcomes; drives the process exit status
//!
//! # Responsibilities
//! - Kinds are independent: a failure in one kind is recorded and the others
//!   carry on. Kinds run concurrently and share no mutable state.
//! - The commit identity is resolved once per publishing run; missing author
//!   metadata fails every publishing kind rather than falling back to a default.
//!
//! # Callable From
//! - Used by the CLI crate and by integration tests with mock generators and
//!   in-memory repositories.

use std::fmt;
use std::io::ErrorKind;

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::contract::{
    payload_digest, Artifact, ArtifactKind, ArtifactTarget, Generator, Identity, SourceRevision,
    TargetRepository,
};
use crate::error::{GenerateError, IdentityError, PipelineError};
use crate::identity::resolve_identity;
use crate::publisher::{publish, PublishOptions, PublishOutcome, PublishReport};

/// Default ref on which publication happens.
pub const DEFAULT_MAINLINE_REF: &str = "refs/heads/master";

/// One artifact kind and where it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    pub target: ArtifactTarget,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mainline_ref: String,
    pub options: PublishOptions,
    pub artifacts: Vec<ArtifactSpec>,
}

/// What triggered this run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Fully qualified ref of the run, e.g. `refs/heads/master` or `refs/pull/1/merge`.
    pub git_ref: String,
    /// Author metadata of the triggering revision. Required for publishing runs.
    pub revision: Option<SourceRevision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Publish,
    DryRun,
}

impl RunMode {
    /// Publication is gated on the mainline ref; everything else is a dry run.
    pub fn for_ref(mainline_ref: &str, git_ref: &str) -> Self {
        if git_ref == mainline_ref {
            RunMode::Publish
        } else {
            RunMode::DryRun
        }
    }
}

#[derive(Debug)]
pub enum KindStatus {
    Published(PublishReport),
    /// Generated successfully; publication intentionally skipped.
    DryRun { digest: String, bytes: usize },
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct KindReport {
    pub kind: ArtifactKind,
    pub status: KindStatus,
}

impl KindReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, KindStatus::Failed(_))
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub mode: RunMode,
    pub kinds: Vec<KindReport>,
}

impl PipelineReport {
    /// True iff every kind reached `Done` or was skipped by a dry run.
    pub fn is_success(&self) -> bool {
        !self.kinds.iter().any(KindReport::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &KindReport> {
        self.kinds.iter().filter(|k| k.is_failure())
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            RunMode::Publish => "publish",
            RunMode::DryRun => "dry-run",
        };
        writeln!(f, "mode: {mode}")?;
        for report in &self.kinds {
            match &report.status {
                KindStatus::Published(p) => writeln!(
                    f,
                    "{}: {} after {} push attempt(s) (sha256 {})",
                    report.kind,
                    match &p.outcome {
                        PublishOutcome::Pushed { commit_id } =>
                            format!("pushed {commit_id}"),
                        PublishOutcome::NoOp => "no-op".to_string(),
                    },
                    p.push_attempts,
                    p.digest
                )?,
                KindStatus::DryRun { digest, bytes } => writeln!(
                    f,
                    "{}: generated {bytes} bytes (sha256 {digest}), not published",
                    report.kind
                )?,
                KindStatus::Failed(e) => writeln!(f, "{}: FAILED: {e}", report.kind)?,
            }
        }
        Ok(())
    }
}

/// Run every configured kind: generate, then publish when on the mainline ref.
///
/// `open_repository` is called only for publishing kinds, after generation
/// succeeded, and must return an un-cloned working copy for the target.
pub async fn run_pipeline<G, F, R>(
    config: &PipelineConfig,
    context: &RunContext,
    generator: &G,
    open_repository: F,
) -> PipelineReport
where
    G: Generator + ?Sized,
    F: Fn(&ArtifactSpec) -> Result<R, PipelineError>,
    R: TargetRepository,
{
    let mode = RunMode::for_ref(&config.mainline_ref, &context.git_ref);
    info!(
        git_ref = %context.git_ref,
        mainline_ref = %config.mainline_ref,
        ?mode,
        kinds = config.artifacts.len(),
        "[PIPELINE] Starting run"
    );

    let identity = match mode {
        RunMode::Publish => Some(
            context
                .revision
                .as_ref()
                .ok_or(IdentityError::MissingRevision)
                .and_then(resolve_identity),
        ),
        RunMode::DryRun => None,
    };

    let runs = config.artifacts.iter().map(|spec| {
        run_kind(
            spec,
            mode,
            identity.as_ref(),
            context.revision.as_ref(),
            &config.options,
            generator,
            &open_repository,
        )
    });
    let kinds = join_all(runs).await;

    let report = PipelineReport { mode, kinds };
    if report.is_success() {
        info!(?mode, "[PIPELINE] All kinds completed");
    } else {
        error!(
            ?mode,
            failed = report.failures().count(),
            "[PIPELINE] Run finished with failures"
        );
    }
    report
}

async fn run_kind<G, F, R>(
    spec: &ArtifactSpec,
    mode: RunMode,
    identity: Option<&Result<Identity, IdentityError>>,
    revision: Option<&SourceRevision>,
    options: &PublishOptions,
    generator: &G,
    open_repository: &F,
) -> KindReport
where
    G: Generator + ?Sized,
    F: Fn(&ArtifactSpec) -> Result<R, PipelineError>,
    R: TargetRepository,
{
    let result = generate_and_publish(
        spec,
        mode,
        identity,
        revision,
        options,
        generator,
        open_repository,
    )
    .await;
    let status = match result {
        Ok(status) => status,
        Err(e) => {
            error!(kind = %spec.kind, error = %e, "[PIPELINE] Kind failed");
            KindStatus::Failed(e)
        }
    };
    KindReport {
        kind: spec.kind,
        status,
    }
}

async fn generate_and_publish<G, F, R>(
    spec: &ArtifactSpec,
    mode: RunMode,
    identity: Option<&Result<Identity, IdentityError>>,
    revision: Option<&SourceRevision>,
    options: &PublishOptions,
    generator: &G,
    open_repository: &F,
) -> Result<KindStatus, PipelineError>
where
    G: Generator + ?Sized,
    F: Fn(&ArtifactSpec) -> Result<R, PipelineError>,
    R: TargetRepository,
{
    let artifact = generate(spec, generator).await?;

    if mode == RunMode::DryRun {
        info!(
            kind = %spec.kind,
            bytes = artifact.payload.len(),
            "[PIPELINE] Not on mainline ref, skipping publication"
        );
        return Ok(KindStatus::DryRun {
            digest: artifact.digest(),
            bytes: artifact.payload.len(),
        });
    }

    let identity = match identity {
        Some(Ok(identity)) => identity,
        Some(Err(e)) => return Err(e.clone().into()),
        None => return Err(IdentityError::MissingRevision.into()),
    };
    let revision = revision.ok_or(IdentityError::MissingRevision)?;

    let mut repo = open_repository(spec)?;
    let report = publish(&mut repo, &artifact, identity, revision, options).await?;
    Ok(KindStatus::Published(report))
}

/// Generate one artifact into a fresh temporary directory and read it back.
pub async fn generate<G>(spec: &ArtifactSpec, generator: &G) -> Result<Artifact, PipelineError>
where
    G: Generator + ?Sized,
{
    let dir = tempfile::Builder::new()
        .prefix("artifact-generate-")
        .tempdir()
        .map_err(PipelineError::Workspace)?;
    let file_name = std::path::Path::new(&spec.target.path)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "artifact".into());
    let output_path = dir.path().join(file_name);

    generator.generate(spec.kind, &output_path).await?;

    let payload = match tokio::fs::read(&output_path).await {
        Ok(payload) => payload,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(kind = %spec.kind, path = %output_path.display(), "[PIPELINE] Generator reported success without output");
            return Err(GenerateError::MissingOutput {
                kind: spec.kind,
                path: output_path,
            }
            .into());
        }
        Err(source) => {
            return Err(PipelineError::ReadArtifact {
                path: output_path,
                source,
            })
        }
    };

    info!(
        kind = %spec.kind,
        bytes = payload.len(),
        digest = %payload_digest(&payload),
        "[PIPELINE] Generated artifact"
    );

    Ok(Artifact {
        kind: spec.kind,
        repo_url: spec.target.url.clone(),
        path: spec.target.path.clone(),
        payload,
    })
}
