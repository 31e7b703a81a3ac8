//! The Forge Client (C1): a typed, rate-limit-aware capability set for
//! talking to a remote code-forge. Represented as a single object-safe trait
//! rather than a struct of function pointers since a trait already gives us
//! exactly the "capability set with swappable implementations" shape we
//! need, and keeps `Arc<dyn Forge>` ergonomic at every call site.

pub mod github;
pub mod mock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One entry returned by `ListTree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub is_dir: bool,
}

/// One open pull request as seen by `ListOpenPRs`/`CreatePR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub head_branch: String,
    pub html_url: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePrParams {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub reviewers: Vec<String>,
    pub team_reviewers: Vec<String>,
    /// Request automerge on the PR once it's opened, where the forge
    /// supports it.
    pub automerge: bool,
}

/// Capability set exposed against a remote hosted Git forge. Every operation
/// accepts a cancellation token and is expected to return promptly once it
/// trips. Read operations are idempotent and safe to retry; implementations
/// are responsible for classifying failures into [`crate::error::SyncError`]
/// so the executor can apply the right recovery policy.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn get_latest_commit(&self, repo: &str, branch: &str, ct: &CancellationToken) -> Result<String>;

    async fn get_default_branch(&self, repo: &str, ct: &CancellationToken) -> Result<String>;

    /// Lists branches whose name starts with `name_prefix`. Narrowing by
    /// prefix (which embeds the group id, see `crate::naming`) keeps this
    /// cheap even for forges/repos with thousands of branches.
    async fn list_branches(
        &self,
        repo: &str,
        name_prefix: &str,
        ct: &CancellationToken,
    ) -> Result<Vec<String>>;

    /// `Ok(None)` means the file does not exist at `git_ref`; that is not an
    /// error condition by itself (callers decide whether absence matters).
    async fn get_file_content(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        ct: &CancellationToken,
    ) -> Result<Option<Vec<u8>>>;

    async fn list_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        recursive: bool,
        ct: &CancellationToken,
    ) -> Result<Vec<TreeEntry>>;

    async fn list_open_prs(
        &self,
        repo: &str,
        head_branch_prefix: &str,
        ct: &CancellationToken,
    ) -> Result<Vec<PullRequest>>;

    async fn create_pr(
        &self,
        repo: &str,
        params: &CreatePrParams,
        ct: &CancellationToken,
    ) -> Result<PullRequest>;

    async fn close_pr(&self, repo: &str, number: u64, comment: Option<&str>, ct: &CancellationToken) -> Result<()>;

    async fn delete_branch(&self, repo: &str, name: &str, ct: &CancellationToken) -> Result<()>;
}
