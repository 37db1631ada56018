/// `load_config` module: Loads a static YAML config into the typed [`PublishConfig`].
///
/// This module is the only place where untrusted YAML is parsed and mapped to
/// the strongly-typed pipeline configuration of `artifact-publish-core`.
///
/// # Responsibilities
/// - Parse the user-supplied YAML configuration file into type-safe structs
/// - Fill defaults (mainline ref, retry budget, commit message prefix)
/// - Reject configurations the publisher cannot honour: zero retry budget,
///   duplicate kinds, empty commands, target paths escaping the repository,
///   and two kinds writing to the same branch of the same repository
/// - Convert to [`PipelineConfig`] and [`CommandGenerator`] for the pipeline
///
/// Secrets never live in this file: targets name the environment variable
/// holding their push token (`token_env`), read only when publishing.
///
/// # Example
/// ```yaml
/// mainline_ref: refs/heads/master
/// source_repository: getsentry/relay
/// max_attempts: 5
/// artifacts:
///   - kind: schema
///     command: [cargo, run, -p, generate-schema, --, -o, "{output}"]
///     target:
///       url: https://github.com/getsentry/sentry-data-schemas.git
///       branch: main
///       path: relay/event.schema.json
///       token_env: DATA_SCHEMAS_TOKEN
/// ```
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use artifact_publish_core::contract::{ArtifactKind, ArtifactTarget};
use artifact_publish_core::generator::CommandGenerator;
use artifact_publish_core::pipeline::{ArtifactSpec, PipelineConfig, DEFAULT_MAINLINE_REF};
use artifact_publish_core::publisher::{PublishOptions, DEFAULT_MAX_ATTEMPTS};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_SOURCE_REPOSITORY: &str = "getsentry/relay";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("no artifacts configured")]
    NoArtifacts,

    #[error("artifact kind {0} is configured more than once")]
    DuplicateKind(ArtifactKind),

    #[error("generator command for {0} is empty")]
    EmptyCommand(ArtifactKind),

    #[error("target of {kind} has an empty {field}")]
    EmptyTargetField { kind: ArtifactKind, field: &'static str },

    #[error("target path '{path}' of {kind} must be relative and stay inside the repository")]
    InvalidPath { kind: ArtifactKind, path: String },

    #[error("{first} and {second} both publish to {url} branch {branch}")]
    SharedTarget {
        first: ArtifactKind,
        second: ArtifactKind,
        url: String,
        branch: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    #[serde(default = "default_mainline_ref")]
    pub mainline_ref: String,
    #[serde(default = "default_source_repository")]
    pub source_repository: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    pub artifacts: Vec<ArtifactSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSection {
    pub kind: ArtifactKind,
    /// Generator argument vector; `{output}` is replaced with the output path.
    pub command: Vec<String>,
    pub target: ArtifactTarget,
}

fn default_mainline_ref() -> String {
    DEFAULT_MAINLINE_REF.to_string()
}

fn default_source_repository() -> String {
    DEFAULT_SOURCE_REPOSITORY.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl PublishConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.artifacts.is_empty() {
            return Err(ConfigError::NoArtifacts);
        }

        let mut kinds = BTreeSet::new();
        for artifact in &self.artifacts {
            let kind = artifact.kind;
            if !kinds.insert(kind) {
                return Err(ConfigError::DuplicateKind(kind));
            }
            if artifact.command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(ConfigError::EmptyCommand(kind));
            }
            let target = &artifact.target;
            for (field, value) in [("url", &target.url), ("branch", &target.branch)] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyTargetField { kind, field });
                }
            }
            if !is_contained_path(&target.path) {
                return Err(ConfigError::InvalidPath {
                    kind,
                    path: target.path.clone(),
                });
            }
        }

        // Kinds publish concurrently; sharing a branch would make them contend.
        for (i, a) in self.artifacts.iter().enumerate() {
            for b in &self.artifacts[i + 1..] {
                if a.target.url == b.target.url && a.target.branch == b.target.branch {
                    return Err(ConfigError::SharedTarget {
                        first: a.kind,
                        second: b.kind,
                        url: a.target.url.clone(),
                        branch: a.target.branch.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mainline_ref: self.mainline_ref.clone(),
            options: PublishOptions {
                source_repository: self.source_repository.clone(),
                max_attempts: self.max_attempts,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
            },
            artifacts: self
                .artifacts
                .iter()
                .map(|a| ArtifactSpec {
                    kind: a.kind,
                    target: a.target.clone(),
                })
                .collect(),
        }
    }

    /// Command generator with every configured kind registered.
    pub fn generator(&self) -> CommandGenerator {
        self.artifacts
            .iter()
            .fold(CommandGenerator::new(), |generator, a| {
                generator.with_command(a.kind, a.command.clone())
            })
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactSection> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

fn is_contained_path(path: &str) -> bool {
    let path = Path::new(path);
    path.file_name().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Loads and validates a static YAML config file (no secrets).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PublishConfig, ConfigError> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(ConfigError::Read {
                path: path_ref.to_path_buf(),
                source: e,
            });
        }
    };

    let config: PublishConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(ConfigError::Parse {
                path: path_ref.to_path_buf(),
                source: e,
            });
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Invalid configuration");
        return Err(e);
    }

    info!(
        config_path = ?path_ref,
        mainline_ref = %config.mainline_ref,
        kinds = config.artifacts.len(),
        "Configuration loaded"
    );
    Ok(config)
}
