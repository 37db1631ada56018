//! In-memory fake of a git remote and its working copies (testing only)
//!
//! [`MemoryRemote`] holds a linear history of [`MemoryCommit`]s for a single
//! branch and accepts a push only if it fast-forwards the tip, which is the
//! same accept/reject contract a real git remote provides. Any number of
//! [`MemoryRepository`] working copies can be opened against one remote to
//! exercise contention without network access.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::contract::{CommitOutcome, Identity, PushOutcome, TargetRepository};
use crate::error::RepoError;

/// Snapshot of the tracked files at a commit.
pub type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: String,
    pub parent: Option<String>,
    pub author: Identity,
    pub message: String,
    pub tree: Tree,
}

impl MemoryCommit {
    fn new(parent: Option<&MemoryCommit>, author: Identity, message: &str, tree: Tree) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.id.as_bytes());
        }
        hasher.update(author.email.as_bytes());
        hasher.update(message.as_bytes());
        for (path, content) in &tree {
            hasher.update(path.as_bytes());
            hasher.update(content);
        }
        Self {
            id: format!("{:x}", hasher.finalize()),
            parent: parent.map(|p| p.id.clone()),
            author,
            message: message.to_string(),
            tree,
        }
    }
}

#[derive(Debug)]
struct RemoteState {
    history: Vec<MemoryCommit>,
    reachable: bool,
    reject_all_pushes: bool,
    fetches: usize,
    pushes: usize,
}

/// Shared, cloneable handle to one fake remote branch.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// A remote whose branch holds a single empty root commit.
    pub fn new() -> Self {
        let root = MemoryCommit::new(None, bot(), "initial", Tree::new());
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                history: vec![root],
                reachable: true,
                reject_all_pushes: false,
                fetches: 0,
                pushes: 0,
            })),
        }
    }

    /// A remote whose tip already contains `path` with `content`.
    pub fn with_file(path: &str, content: &[u8]) -> Self {
        let remote = Self::new();
        remote.commit_directly(bot(), "seed", path, content);
        remote
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a fresh working copy against this remote.
    pub fn repository(&self) -> MemoryRepository {
        MemoryRepository {
            remote: self.clone(),
            head: None,
            index: None,
        }
    }

    /// Advance the branch as another writer would.
    pub fn commit_directly(&self, author: Identity, message: &str, path: &str, content: &[u8]) {
        let mut state = self.lock();
        let tip = state.history.last().cloned();
        let mut tree = tip.as_ref().map(|c| c.tree.clone()).unwrap_or_default();
        tree.insert(path.to_string(), content.to_vec());
        let commit = MemoryCommit::new(tip.as_ref(), author, message, tree);
        state.history.push(commit);
    }

    /// Make every subsequent clone and fetch fail.
    pub fn set_unreachable(&self) {
        self.lock().reachable = false;
    }

    /// Reject every push as non-fast-forward, regardless of ancestry.
    pub fn reject_all_pushes(&self) {
        self.lock().reject_all_pushes = true;
    }

    pub fn history(&self) -> Vec<MemoryCommit> {
        self.lock().history.clone()
    }

    pub fn tip(&self) -> MemoryCommit {
        let state = self.lock();
        state.history[state.history.len() - 1].clone()
    }

    pub fn file_at_tip(&self, path: &str) -> Option<Vec<u8>> {
        self.tip().tree.get(path).cloned()
    }

    /// Commits whose message equals `message`.
    pub fn commits_with_message(&self, message: &str) -> Vec<MemoryCommit> {
        self.lock()
            .history
            .iter()
            .filter(|c| c.message == message)
            .cloned()
            .collect()
    }

    /// True when `ancestor` is on the first-parent chain of the tip.
    pub fn is_ancestor_of_tip(&self, ancestor: &str) -> bool {
        self.lock().history.iter().any(|c| c.id == ancestor)
    }

    /// Number of clones and fetches served.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn push_count(&self) -> usize {
        self.lock().pushes
    }
}

/// Working copy of a [`MemoryRemote`].
#[derive(Debug)]
pub struct MemoryRepository {
    remote: MemoryRemote,
    /// Local tip: the cloned commit, or a local commit on top of it.
    head: Option<MemoryCommit>,
    /// Staged tree, when it differs from what `head` was cloned with.
    index: Option<Tree>,
}

impl MemoryRepository {
    fn head(&self) -> Result<&MemoryCommit, RepoError> {
        self.head.as_ref().ok_or(RepoError::NotCloned)
    }

    fn fetch_tip(&self) -> Result<MemoryCommit, RepoError> {
        let mut state = self.remote.lock();
        if !state.reachable {
            return Err(RepoError::Command {
                command: "fetch".into(),
                stderr: "could not read from remote repository".into(),
            });
        }
        state.fetches += 1;
        Ok(state.history[state.history.len() - 1].clone())
    }
}

#[async_trait]
impl TargetRepository for MemoryRepository {
    async fn clone_tip(&mut self) -> Result<(), RepoError> {
        let tip = self.fetch_tip()?;
        self.head = Some(tip);
        self.index = None;
        Ok(())
    }

    async fn stage(&mut self, path: &str, payload: &[u8]) -> Result<(), RepoError> {
        let mut tree = match &self.index {
            Some(index) => index.clone(),
            None => self.head()?.tree.clone(),
        };
        tree.insert(path.to_string(), payload.to_vec());
        self.index = Some(tree);
        Ok(())
    }

    async fn has_commit_with_message(&mut self, message: &str) -> Result<bool, RepoError> {
        let head = self.head()?;
        if head.message == message {
            return Ok(true);
        }
        let state = self.remote.lock();
        // History is linear: everything up to the head (or the parent of an
        // unpushed local commit) is reachable from it.
        let reachable = match state
            .history
            .iter()
            .position(|c| c.id == head.id || head.parent.as_deref() == Some(c.id.as_str()))
        {
            Some(pos) => &state.history[..=pos],
            None => &state.history[..0],
        };
        Ok(reachable.iter().any(|c| c.message == message))
    }

    async fn commit(
        &mut self,
        identity: &Identity,
        message: &str,
    ) -> Result<CommitOutcome, RepoError> {
        let head = self.head()?.clone();
        let tree = match self.index.take() {
            Some(tree) if tree != head.tree => tree,
            _ => return Ok(CommitOutcome::Unchanged),
        };
        let commit = MemoryCommit::new(Some(&head), identity.clone(), message, tree);
        let commit_id = commit.id.clone();
        self.head = Some(commit);
        Ok(CommitOutcome::Created { commit_id })
    }

    async fn push(&mut self) -> Result<PushOutcome, RepoError> {
        let head = self.head()?.clone();
        let mut state = self.remote.lock();
        state.pushes += 1;
        if state.reject_all_pushes {
            return Ok(PushOutcome::Rejected);
        }
        let tip = &state.history[state.history.len() - 1];
        if head.id == tip.id {
            return Ok(PushOutcome::Accepted);
        }
        // Fast-forward only: the local commit must sit directly on the tip.
        if head.parent.as_deref() != Some(tip.id.as_str()) {
            return Ok(PushOutcome::Rejected);
        }
        state.history.push(head);
        Ok(PushOutcome::Accepted)
    }

    async fn rebase_onto_remote(&mut self) -> Result<(), RepoError> {
        let tip = self.fetch_tip()?;
        self.head = Some(tip);
        self.index = None;
        Ok(())
    }
}

fn bot() -> Identity {
    Identity {
        name: "seed".into(),
        email: "seed@example.com".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            name: "Alice".into(),
            email: "alice@example.com".into(),
        }
    }

    #[tokio::test]
    async fn push_fast_forwards_tip() {
        let remote = MemoryRemote::new();
        let mut repo = remote.repository();
        repo.clone_tip().await.unwrap();
        repo.stage("a.json", b"1").await.unwrap();
        let outcome = repo.commit(&alice(), "m").await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Created { .. }));
        assert_eq!(repo.push().await.unwrap(), PushOutcome::Accepted);
        assert_eq!(remote.file_at_tip("a.json"), Some(b"1".to_vec()));
        assert_eq!(remote.history().len(), 2);
    }

    #[tokio::test]
    async fn stale_working_copy_is_rejected() {
        let remote = MemoryRemote::new();
        let mut repo = remote.repository();
        repo.clone_tip().await.unwrap();
        remote.commit_directly(alice(), "other", "b.json", b"2");

        repo.stage("a.json", b"1").await.unwrap();
        repo.commit(&alice(), "m").await.unwrap();
        assert_eq!(repo.push().await.unwrap(), PushOutcome::Rejected);
        assert_eq!(remote.history().len(), 2);
    }

    #[tokio::test]
    async fn identical_content_commits_nothing() {
        let remote = MemoryRemote::with_file("a.json", b"1");
        let mut repo = remote.repository();
        repo.clone_tip().await.unwrap();
        repo.stage("a.json", b"1").await.unwrap();
        assert_eq!(
            repo.commit(&alice(), "m").await.unwrap(),
            CommitOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn finds_messages_reachable_from_head_only() {
        let remote = MemoryRemote::new();
        remote.commit_directly(alice(), "getsentry/relay@abc", "a.json", b"1");
        let mut repo = remote.repository();
        repo.clone_tip().await.unwrap();
        remote.commit_directly(alice(), "getsentry/relay@def", "a.json", b"2");

        assert!(repo.has_commit_with_message("getsentry/relay@abc").await.unwrap());
        assert!(!repo.has_commit_with_message("getsentry/relay@def").await.unwrap());
        assert!(!repo.has_commit_with_message("getsentry/relay@ab").await.unwrap());

        repo.rebase_onto_remote().await.unwrap();
        assert!(repo.has_commit_with_message("getsentry/relay@def").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_remote_fails_clone() {
        let remote = MemoryRemote::new();
        remote.set_unreachable();
        let mut repo = remote.repository();
        assert!(repo.clone_tip().await.is_err());
    }
}
