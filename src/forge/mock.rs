//! In-memory [`Forge`] stand-in used by every test in this crate. Never talks
//! to the network; state lives entirely in a locked snapshot that tests seed
//! and inspect directly.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::forge::{CreatePrParams, Forge, PullRequest, TreeEntry};

#[derive(Debug, Clone, Default)]
pub struct MockRepo {
    pub default_branch: String,
    /// branch name -> commit sha
    pub branches: HashMap<String, String>,
    /// (git_ref, path) -> file content
    pub files: HashMap<(String, String), Vec<u8>>,
    /// git_ref -> full set of paths present at that ref (for ListTree)
    pub trees: HashMap<String, Vec<TreeEntry>>,
    pub open_prs: Vec<PullRequest>,
    next_pr_number: u64,
}

#[derive(Debug, Default)]
struct State {
    repos: HashMap<String, MockRepo>,
}

/// Thread-safe, clonable handle to a shared mock forge. Construct with
/// [`MockForge::new`], seed it via [`MockForge::seed`], then hand `Arc<dyn
/// Forge>` clones to the code under test while keeping the original `MockForge`
/// around for assertions.
#[derive(Clone, Default)]
pub struct MockForge {
    state: std::sync::Arc<Mutex<State>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a repo's full state.
    pub fn seed(&self, repo: &str, data: MockRepo) {
        self.state.lock().repos.insert(repo.to_string(), data);
    }

    /// Reads back a repo's current state for assertions.
    pub fn snapshot(&self, repo: &str) -> Option<MockRepo> {
        self.state.lock().repos.get(repo).cloned()
    }

    fn guard(ct: &CancellationToken) -> Result<()> {
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn get_latest_commit(&self, repo: &str, branch: &str, ct: &CancellationToken) -> Result<String> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        r.branches
            .get(branch)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("branch {branch} in {repo}")))
    }

    async fn get_default_branch(&self, repo: &str, ct: &CancellationToken) -> Result<String> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        Ok(r.default_branch.clone())
    }

    async fn list_branches(&self, repo: &str, name_prefix: &str, ct: &CancellationToken) -> Result<Vec<String>> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        Ok(r.branches
            .keys()
            .filter(|b| b.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn get_file_content(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        ct: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        Ok(r.files.get(&(git_ref.to_string(), path.to_string())).cloned())
    }

    async fn list_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        _recursive: bool,
        ct: &CancellationToken,
    ) -> Result<Vec<TreeEntry>> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        let prefix = path.trim_matches('/');
        Ok(r.trees
            .get(git_ref)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| prefix.is_empty() || e.path.starts_with(prefix))
            .collect())
    }

    async fn list_open_prs(
        &self,
        repo: &str,
        head_branch_prefix: &str,
        ct: &CancellationToken,
    ) -> Result<Vec<PullRequest>> {
        Self::guard(ct)?;
        let state = self.state.lock();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        Ok(r.open_prs
            .iter()
            .filter(|pr| pr.head_branch.starts_with(head_branch_prefix))
            .cloned()
            .collect())
    }

    async fn create_pr(&self, repo: &str, params: &CreatePrParams, ct: &CancellationToken) -> Result<PullRequest> {
        Self::guard(ct)?;
        let mut state = self.state.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        if r.open_prs.iter().any(|pr| pr.head_branch == params.head) {
            return Err(SyncError::PrConflict(format!(
                "PR for head {:?} already exists",
                params.head
            )));
        }
        r.next_pr_number += 1;
        let pr = PullRequest {
            number: r.next_pr_number,
            head_branch: params.head.clone(),
            html_url: format!("https://example.invalid/{repo}/pull/{}", r.next_pr_number),
            body: params.body.clone(),
        };
        r.open_prs.push(pr.clone());
        Ok(pr)
    }

    async fn close_pr(&self, repo: &str, number: u64, _comment: Option<&str>, ct: &CancellationToken) -> Result<()> {
        Self::guard(ct)?;
        let mut state = self.state.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        r.open_prs.retain(|pr| pr.number != number);
        Ok(())
    }

    async fn delete_branch(&self, repo: &str, name: &str, ct: &CancellationToken) -> Result<()> {
        Self::guard(ct)?;
        let mut state = self.state.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| SyncError::NotFound(format!("repo {repo}")))?;
        r.branches.remove(name);
        Ok(())
    }
}
