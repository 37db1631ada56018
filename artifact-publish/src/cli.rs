/// # artifact-publish CLI Interface (Module)
///
/// This module implements the CLI for artifact-publish: command parsing,
/// argument validation and the async entrypoint used by `main` and tests.
///
/// All protocol logic (generation, publication, retry) lives in the
/// [`artifact-publish-core`] crate. This module only wires configuration,
/// environment and the real git/generator implementations into it.
///
/// ## Features
/// - `run`: generate every configured artifact; publish when the triggering
///   ref is the mainline ref. Ref and revision default to the CI environment
///   (`GITHUB_REF`, `GITHUB_SHA`).
/// - `generate`: run a single generator locally and write its output.
///
/// ## Exit status
/// [`run`] returns an error whenever any kind failed, so the binary exits
/// non-zero. Dry runs and no-op publications are successes.
///
/// [`artifact-publish-core`]: ../../artifact-publish-core/
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use artifact_publish_core::contract::{ArtifactKind, Generator, SourceRevision};
use artifact_publish_core::error::PipelineError;
use artifact_publish_core::git::{read_source_revision, GitRepository};
use artifact_publish_core::pipeline::{run_pipeline, ArtifactSpec, RunContext, RunMode};
use clap::{Parser, Subcommand};

use crate::load_config::load_config;

/// CLI for artifact-publish: generate derived artifacts and commit them downstream.
#[derive(Parser)]
#[clap(
    name = "artifact-publish",
    version,
    about = "Generate derived artifacts and publish them into downstream git repositories"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate all configured artifacts and publish them when on the mainline ref
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Fully qualified ref that triggered this run
        #[clap(long, env = "GITHUB_REF")]
        git_ref: String,
        /// Source revision being published
        #[clap(long, env = "GITHUB_SHA")]
        revision: Option<String>,
        /// Commit author name; read from the source checkout when omitted
        #[clap(long, requires = "author_email")]
        author_name: Option<String>,
        /// Commit author email; read from the source checkout when omitted
        #[clap(long, requires = "author_name")]
        author_email: Option<String>,
        /// Source checkout the generators run in
        #[clap(long, default_value = ".")]
        source_dir: PathBuf,
    },
    /// Run one generator and write its artifact to a local file
    Generate {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Artifact kind (schema, metrics-doc)
        #[clap(long)]
        kind: ArtifactKind,
        /// Where to write the artifact
        #[clap(long)]
        output: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run {
            config,
            git_ref,
            revision,
            author_name,
            author_email,
            source_dir,
        } => {
            let config = load_config(&config)?;
            let pipeline_config = config.pipeline_config();
            let mode = RunMode::for_ref(&pipeline_config.mainline_ref, &git_ref);
            tracing::info!(command = "run", %git_ref, ?mode, "Starting publication run");

            let author = author_name.zip(author_email);
            let revision = match resolve_revision(&source_dir, revision, author).await {
                Ok(revision) => Some(revision),
                Err(e) if mode == RunMode::Publish => {
                    return Err(e.context("cannot publish without source revision metadata"));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "No source revision metadata, continuing dry run");
                    None
                }
            };

            let generator = config.generator().in_dir(&source_dir);
            let context = RunContext { git_ref, revision };
            let report =
                run_pipeline(&pipeline_config, &context, &generator, open_repository).await;

            println!("{report}");
            if !report.is_success() {
                tracing::error!(
                    command = "run",
                    failed = report.failures().count(),
                    "Publication run failed"
                );
                bail!(
                    "{} of {} artifact kind(s) failed",
                    report.failures().count(),
                    report.kinds.len()
                );
            }
            tracing::info!(command = "run", "Publication run complete");
            Ok(())
        }
        Commands::Generate {
            config,
            kind,
            output,
        } => {
            let config = load_config(&config)?;
            tracing::info!(command = "generate", %kind, output = %output.display(), "Generating artifact");
            config
                .generator()
                .generate(kind, &output)
                .await
                .with_context(|| format!("failed to generate {kind}"))?;
            println!("{kind}: written to {}", output.display());
            Ok(())
        }
    }
}

/// Revision metadata from the flags, or from `git log` in the source checkout.
async fn resolve_revision(
    source_dir: &Path,
    revision: Option<String>,
    author: Option<(String, String)>,
) -> Result<SourceRevision> {
    let rev = revision.as_deref().unwrap_or("HEAD");
    match author {
        Some((author_name, author_email)) => {
            let id = match revision {
                Some(id) => id,
                None => read_source_revision(source_dir, rev).await?.id,
            };
            Ok(SourceRevision {
                id,
                author_name,
                author_email,
            })
        }
        None => read_source_revision(source_dir, rev)
            .await
            .with_context(|| format!("failed to read revision {rev} in {}", source_dir.display())),
    }
}

/// Working copy for one target, with its push token from the environment.
fn open_repository(spec: &ArtifactSpec) -> Result<GitRepository, PipelineError> {
    let token = match &spec.target.token_env {
        Some(var) => Some(
            std::env::var(var)
                .ok()
                .filter(|token| !token.is_empty())
                .ok_or_else(|| PipelineError::MissingCredentials(var.clone()))?,
        ),
        None => None,
    };
    Ok(GitRepository::new(spec.target.clone(), token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact_publish_core::contract::ArtifactTarget;
    use serial_test::serial;

    const VAR: &str = "ARTIFACT_PUBLISH_CLI_TEST_TOKEN";

    fn spec(token_env: Option<&str>) -> ArtifactSpec {
        ArtifactSpec {
            kind: ArtifactKind::Schema,
            target: ArtifactTarget {
                url: "https://github.com/getsentry/sentry-data-schemas.git".into(),
                branch: "main".into(),
                path: "relay/event.schema.json".into(),
                token_env: token_env.map(str::to_string),
            },
        }
    }

    #[test]
    #[serial]
    fn token_is_read_from_named_variable() {
        std::env::set_var(VAR, "s3cret");
        assert!(open_repository(&spec(Some(VAR))).is_ok());
        std::env::remove_var(VAR);
    }

    #[test]
    #[serial]
    fn missing_or_empty_token_is_a_credentials_error() {
        std::env::remove_var(VAR);
        assert!(matches!(
            open_repository(&spec(Some(VAR))),
            Err(PipelineError::MissingCredentials(ref v)) if v == VAR
        ));

        std::env::set_var(VAR, "");
        assert!(matches!(
            open_repository(&spec(Some(VAR))),
            Err(PipelineError::MissingCredentials(_))
        ));
        std::env::remove_var(VAR);
    }

    #[test]
    fn targets_without_token_env_need_no_credentials() {
        assert!(open_repository(&spec(None)).is_ok());
    }
}
