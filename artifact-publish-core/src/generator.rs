//! Command-backed [`Generator`]: runs an external tool that writes one artifact.
//!
//! Each kind maps to an argument vector. The placeholder `{output}` in any
//! argument is replaced with the requested output path, e.g.
//! `["cargo", "run", "-p", "generate-schema", "--", "-o", "{output}"]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::contract::{ArtifactKind, Generator};
use crate::error::GenerateError;

pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, Default)]
pub struct CommandGenerator {
    commands: BTreeMap<ArtifactKind, Vec<String>>,
    working_dir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the command that generates `kind`.
    pub fn with_command(mut self, kind: ArtifactKind, command: Vec<String>) -> Self {
        self.commands.insert(kind, command);
        self
    }

    /// Run generator commands from `dir` instead of the current directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Substitute the output placeholder in every argument.
pub fn render_args(command: &[String], output_path: &Path) -> Vec<String> {
    let output = output_path.to_string_lossy();
    command
        .iter()
        .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
        .collect()
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, kind: ArtifactKind, output_path: &Path) -> Result<(), GenerateError> {
        let command = self
            .commands
            .get(&kind)
            .ok_or(GenerateError::NotConfigured(kind))?;
        let args = render_args(command, output_path);
        let (program, rest) = args
            .split_first()
            .ok_or(GenerateError::EmptyCommand(kind))?;

        info!(%kind, program = %program, args = ?rest, "[GENERATE] Running generator");

        let mut cmd = Command::new(program);
        cmd.args(rest);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let status = cmd.status().await.map_err(|source| {
            error!(%kind, program = %program, error = ?source, "[GENERATE] Failed to launch generator");
            GenerateError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

        if !status.success() {
            error!(%kind, status = ?status, "[GENERATE] Generator exited with non-zero code");
            return Err(GenerateError::Failed {
                kind,
                code: status.code(),
            });
        }

        if !tokio::fs::try_exists(output_path).await.unwrap_or(false) {
            error!(%kind, path = %output_path.display(), "[GENERATE] Generator produced no output");
            return Err(GenerateError::MissingOutput {
                kind,
                path: output_path.to_path_buf(),
            });
        }

        info!(%kind, path = %output_path.display(), "[GENERATE] Generator succeeded");
        Ok(())
    }
}
