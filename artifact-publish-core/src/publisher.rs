//! Publication protocol: commit one artifact into one target repository,
//! tolerating concurrent writers through fetch-rebase-retry.
//!
//! The protocol is an explicit state machine:
//!
//! ```text
//! Init → Cloned → Staged → Committed → PushAttempted ─┬→ Done(pushed)
//!                   ↑  │                               └→ Rejected ─┬→ Rebasing ─┐
//!                   │  └→ Done(no-op)                               └→ Exhausted  │
//!                   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Publisher::step`] performs exactly one transition, so callers (and tests)
//! can drive several publishers in a chosen interleaving. [`publish`] runs a
//! publisher to completion.
//!
//! A revision whose commit message is already in the target history is never
//! committed again: `Staged` checks the history first (after the clone and
//! after every rebase) and ends in `Done(no-op)`.
//!
//! # Error Handling
//! - Clone failures are fatal and never retried ([`PublishError::Clone`]).
//! - Push rejections are contention: handled here by moving onto the remote
//!   tip, restaging and recommitting, up to [`PublishOptions::max_attempts`]
//!   push attempts.
//! - Any other git failure is fatal ([`PublishError::Repository`]).
//! - Running out of attempts is fatal ([`PublishError::Exhausted`]).

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::contract::{
    Artifact, ArtifactKind, CommitOutcome, Identity, PushOutcome, SourceRevision,
    TargetRepository,
};
use crate::error::{PublishError, RepoError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Knobs for one publish operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Prefix of the commit message, typically `<owner>/<repo>` of the source.
    pub source_repository: String,
    /// Maximum number of push attempts.
    pub max_attempts: u32,
    /// Flat delay before each retry.
    pub retry_delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            source_repository: "getsentry/relay".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Deterministic commit message for `revision`, recognisable on re-runs.
pub fn commit_message(source_repository: &str, revision: &SourceRevision) -> String {
    format!("{source_repository}@{}", revision.id)
}

/// States of the publication protocol. `attempt` counts push attempts, from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Init,
    Cloned,
    Staged { attempt: u32 },
    Committed { attempt: u32, commit_id: String },
    PushAttempted {
        attempt: u32,
        commit_id: String,
        outcome: PushOutcome,
    },
    Rejected { attempt: u32 },
    Rebasing { attempt: u32 },
    Done(PublishOutcome),
    Exhausted { attempts: u32 },
}

impl PublishState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishState::Done(_) | PublishState::Exhausted { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            PublishState::Init => "cloning",
            PublishState::Cloned => "staging",
            PublishState::Staged { .. } => "committing",
            PublishState::Committed { .. } => "pushing",
            PublishState::PushAttempted { .. } => "evaluating push",
            PublishState::Rejected { .. } => "handling rejection",
            PublishState::Rebasing { .. } => "rebasing",
            PublishState::Done(_) => "done",
            PublishState::Exhausted { .. } => "exhausted",
        }
    }
}

/// Transition out of `Rejected`: retry while budget remains, otherwise give up.
pub fn after_rejection(attempt: u32, max_attempts: u32) -> PublishState {
    if attempt >= max_attempts {
        PublishState::Exhausted { attempts: attempt }
    } else {
        PublishState::Rebasing {
            attempt: attempt + 1,
        }
    }
}

/// Successful end of a publish operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PublishOutcome {
    Pushed { commit_id: String },
    NoOp,
}

/// Outcome recorded for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Pushed,
    NoOp,
    Rejected,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishAttempt {
    pub number: u32,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub kind: ArtifactKind,
    pub outcome: PublishOutcome,
    /// Number of pushes made; zero for a no-op on the first attempt.
    pub push_attempts: u32,
    pub attempts: Vec<PublishAttempt>,
    pub digest: String,
}

/// Drives one artifact through the publication protocol.
pub struct Publisher<'a, R: TargetRepository + ?Sized> {
    repo: &'a mut R,
    artifact: &'a Artifact,
    identity: &'a Identity,
    message: String,
    options: &'a PublishOptions,
    attempts: Vec<PublishAttempt>,
    pushes: u32,
}

impl<'a, R: TargetRepository + ?Sized> Publisher<'a, R> {
    pub fn new(
        repo: &'a mut R,
        artifact: &'a Artifact,
        identity: &'a Identity,
        revision: &SourceRevision,
        options: &'a PublishOptions,
    ) -> Self {
        Self {
            repo,
            artifact,
            identity,
            message: commit_message(&options.source_repository, revision),
            options,
            attempts: Vec::new(),
            pushes: 0,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attempts(&self) -> &[PublishAttempt] {
        &self.attempts
    }

    /// Number of push attempts made so far.
    pub fn pushes(&self) -> u32 {
        self.pushes
    }

    /// Perform one transition. Terminal states are returned unchanged.
    pub async fn step(&mut self, state: PublishState) -> Result<PublishState, PublishError> {
        let kind = self.artifact.kind;
        let label = state.label();
        let fatal = |source: RepoError| {
            error!(%kind, state = label, error = %source, "[PUBLISH] Git operation failed");
            PublishError::Repository {
                state: label,
                source,
            }
        };

        let next = match state {
            PublishState::Init => {
                self.repo.clone_tip().await.map_err(|e| {
                    error!(%kind, error = %e, "[PUBLISH] Could not obtain working copy");
                    PublishError::Clone(e)
                })?;
                PublishState::Cloned
            }
            PublishState::Cloned => {
                self.repo
                    .stage(&self.artifact.path, &self.artifact.payload)
                    .await
                    .map_err(fatal)?;
                PublishState::Staged { attempt: 1 }
            }
            PublishState::Staged { attempt } => {
                // At most one commit per revision, even if newer content landed since.
                if self
                    .repo
                    .has_commit_with_message(&self.message)
                    .await
                    .map_err(fatal)?
                {
                    info!(%kind, attempt, message = %self.message, "[PUBLISH] Revision already published, nothing to do");
                    self.record(attempt, AttemptOutcome::NoOp);
                    return Ok(PublishState::Done(PublishOutcome::NoOp));
                }
                match self
                    .repo
                    .commit(self.identity, &self.message)
                    .await
                    .map_err(fatal)?
                {
                    CommitOutcome::Created { commit_id } => {
                        PublishState::Committed { attempt, commit_id }
                    }
                    CommitOutcome::Unchanged => {
                        info!(%kind, attempt, "[PUBLISH] Content unchanged, nothing to publish");
                        self.record(attempt, AttemptOutcome::NoOp);
                        PublishState::Done(PublishOutcome::NoOp)
                    }
                }
            }
            PublishState::Committed { attempt, commit_id } => {
                self.pushes += 1;
                let outcome = self.repo.push().await.map_err(fatal)?;
                PublishState::PushAttempted {
                    attempt,
                    commit_id,
                    outcome,
                }
            }
            PublishState::PushAttempted {
                attempt,
                commit_id,
                outcome: PushOutcome::Accepted,
            } => {
                info!(%kind, attempt, commit_id = %commit_id, "[PUBLISH] Push accepted");
                self.record(attempt, AttemptOutcome::Pushed);
                PublishState::Done(PublishOutcome::Pushed { commit_id })
            }
            PublishState::PushAttempted {
                attempt,
                outcome: PushOutcome::Rejected,
                ..
            } => PublishState::Rejected { attempt },
            PublishState::Rejected { attempt } => {
                let next = after_rejection(attempt, self.options.max_attempts);
                if let PublishState::Exhausted { attempts } = next {
                    error!(%kind, attempts, "[PUBLISH] Retry budget exhausted");
                    self.record(attempt, AttemptOutcome::Exhausted);
                } else {
                    warn!(%kind, attempt, max = self.options.max_attempts, "[PUBLISH] Push rejected, retrying on new tip");
                    self.record(attempt, AttemptOutcome::Rejected);
                }
                next
            }
            PublishState::Rebasing { attempt } => {
                if !self.options.retry_delay.is_zero() {
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                self.repo.rebase_onto_remote().await.map_err(fatal)?;
                self.repo
                    .stage(&self.artifact.path, &self.artifact.payload)
                    .await
                    .map_err(fatal)?;
                PublishState::Staged { attempt }
            }
            terminal @ (PublishState::Done(_) | PublishState::Exhausted { .. }) => terminal,
        };
        Ok(next)
    }

    /// Run the protocol from `Init` to a terminal state.
    pub async fn run(mut self) -> Result<PublishReport, PublishError> {
        info!(
            kind = %self.artifact.kind,
            repo_url = %self.artifact.repo_url,
            path = %self.artifact.path,
            message = %self.message,
            "[PUBLISH] Starting publication"
        );

        let mut state = PublishState::Init;
        while !state.is_terminal() {
            state = self.step(state).await?;
        }

        match state {
            PublishState::Done(outcome) => Ok(self.into_report(outcome)),
            PublishState::Exhausted { attempts } => Err(PublishError::Exhausted { attempts }),
            _ => unreachable!("loop exits only on terminal states"),
        }
    }

    pub fn into_report(self, outcome: PublishOutcome) -> PublishReport {
        PublishReport {
            kind: self.artifact.kind,
            outcome,
            push_attempts: self.pushes,
            attempts: self.attempts,
            digest: self.artifact.digest(),
        }
    }

    fn record(&mut self, number: u32, outcome: AttemptOutcome) {
        self.attempts.push(PublishAttempt { number, outcome });
    }
}

/// Publish `artifact` into `repo`, attributed to `identity`.
pub async fn publish<R>(
    repo: &mut R,
    artifact: &Artifact,
    identity: &Identity,
    revision: &SourceRevision,
    options: &PublishOptions,
) -> Result<PublishReport, PublishError>
where
    R: TargetRepository + ?Sized,
{
    Publisher::new(repo, artifact, identity, revision, options)
        .run()
        .await
}
