//! Real [`Forge`] implementation backed by the GitHub REST API via
//! `octocrab`, with `backon`-driven retry/backoff - the same pairing the
//! pack's own GitHub-hosting client uses for exactly this purpose.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::Engine;
use octocrab::Octocrab;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError, DEFAULT_RATE_LIMIT_RESET};
use crate::forge::{CreatePrParams, Forge, PullRequest, TreeEntry};

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(3)
        .with_jitter()
}

pub struct GitHubForge {
    client: Octocrab,
}

impl GitHubForge {
    /// Builds a client from `GH_TOKEN`/`GITHUB_TOKEN` in the ambient
    /// environment, per §6. A missing token is an `AuthFailed` error since
    /// the forge is unusable without it.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GH_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .map_err(|_| SyncError::AuthFailed("GH_TOKEN/GITHUB_TOKEN not set".into()))?;
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| SyncError::AuthFailed(format!("building GitHub client: {e}")))?;
        Ok(Self { client })
    }

    fn split_repo(repo: &str) -> Result<(&str, &str)> {
        repo.split_once('/')
            .ok_or_else(|| SyncError::InvalidInput(format!("repo {repo:?} is not owner/name")))
    }

    async fn guard(&self, ct: &CancellationToken) -> Result<()> {
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RefObject {
    object: RefObjectInner,
}

#[derive(Deserialize)]
struct RefObjectInner {
    sha: String,
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct BranchInfo {
    name: String,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    content: Option<String>,
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct PrResponse {
    number: u64,
    html_url: String,
    body: Option<String>,
    head: PrHead,
    node_id: String,
}

#[derive(Deserialize)]
struct PrHead {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[async_trait]
impl Forge for GitHubForge {
    async fn get_latest_commit(&self, repo: &str, branch: &str, ct: &CancellationToken) -> Result<String> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let route = format!("/repos/{owner}/{name}/git/ref/heads/{branch}");
        let result: std::result::Result<RefObject, octocrab::Error> = (|| async {
            self.client.get(&route, None::<&()>).await
        })
        .retry(&retry_policy())
        .when(|e| SyncError::from_ref(e).should_retry())
        .await;
        Ok(result.map_err(SyncError::from)?.object.sha)
    }

    async fn get_default_branch(&self, repo: &str, ct: &CancellationToken) -> Result<String> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let route = format!("/repos/{owner}/{name}");
        let info: RepoInfo = self
            .client
            .get(&route, None::<&()>)
            .await
            .map_err(SyncError::from)?;
        Ok(info.default_branch)
    }

    async fn list_branches(
        &self,
        repo: &str,
        name_prefix: &str,
        ct: &CancellationToken,
    ) -> Result<Vec<String>> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let mut page = 1u32;
        let mut matches = Vec::new();
        loop {
            self.guard(ct).await?;
            let route = format!("/repos/{owner}/{name}/branches?per_page=100&page={page}");
            let branches: Vec<BranchInfo> = self
                .client
                .get(&route, None::<&()>)
                .await
                .map_err(SyncError::from)?;
            if branches.is_empty() {
                break;
            }
            let count = branches.len();
            matches.extend(
                branches
                    .into_iter()
                    .map(|b| b.name)
                    .filter(|n| n.starts_with(name_prefix)),
            );
            if count < 100 {
                break;
            }
            page += 1;
        }
        Ok(matches)
    }

    async fn get_file_content(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        ct: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let route = format!("/repos/{owner}/{name}/contents/{path}?ref={git_ref}");
        let result: std::result::Result<ContentItem, octocrab::Error> = (|| async {
            self.client.get(&route, None::<&()>).await
        })
        .retry(&retry_policy())
        .when(|e| SyncError::from_ref(e).should_retry())
        .await;
        match result {
            Ok(item) => {
                let encoded = item.content.unwrap_or_default();
                let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(cleaned)
                    .map_err(|e| SyncError::InvalidInput(format!("decoding base64 content: {e}")))?;
                Ok(Some(bytes))
            }
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 404 => Ok(None),
            Err(e) => Err(SyncError::from(e)),
        }
    }

    async fn list_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        recursive: bool,
        ct: &CancellationToken,
    ) -> Result<Vec<TreeEntry>> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let ref_route = format!("/repos/{owner}/{name}/git/ref/heads/{git_ref}");
        let head: std::result::Result<RefObject, octocrab::Error> =
            self.client.get(&ref_route, None::<&()>).await;
        let tree_sha = match head {
            Ok(r) => r.object.sha,
            // git_ref may already be a commit sha rather than a branch name.
            Err(_) => git_ref.to_string(),
        };
        let recursive_q = if recursive { "?recursive=1" } else { "" };
        let route = format!("/repos/{owner}/{name}/git/trees/{tree_sha}{recursive_q}");
        let tree: TreeResponse = self
            .client
            .get(&route, None::<&()>)
            .await
            .map_err(SyncError::from)?;
        let prefix = path.trim_matches('/');
        Ok(tree
            .tree
            .into_iter()
            .filter(|item| prefix.is_empty() || item.path.starts_with(prefix))
            .map(|item| TreeEntry {
                path: item.path,
                is_dir: item.kind == "tree",
            })
            .collect())
    }

    async fn list_open_prs(
        &self,
        repo: &str,
        head_branch_prefix: &str,
        ct: &CancellationToken,
    ) -> Result<Vec<PullRequest>> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        let route = format!("/repos/{owner}/{name}/pulls?state=open&per_page=100");
        let prs: Vec<PrResponse> = self
            .client
            .get(&route, None::<&()>)
            .await
            .map_err(SyncError::from)?;
        Ok(prs
            .into_iter()
            .filter(|pr| pr.head.git_ref.starts_with(head_branch_prefix))
            .map(|pr| PullRequest {
                number: pr.number,
                head_branch: pr.head.git_ref,
                html_url: pr.html_url,
                body: pr.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_pr(
        &self,
        repo: &str,
        params: &CreatePrParams,
        ct: &CancellationToken,
    ) -> Result<PullRequest> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        #[derive(serde::Serialize)]
        struct Body<'a> {
            title: &'a str,
            body: &'a str,
            head: &'a str,
            base: &'a str,
        }
        let route = format!("/repos/{owner}/{name}/pulls");
        let body = Body {
            title: &params.title,
            body: &params.body,
            head: &params.head,
            base: &params.base,
        };
        let result: std::result::Result<PrResponse, octocrab::Error> = (|| async {
            self.client.post(&route, Some(&body)).await
        })
        .retry(&retry_policy())
        .when(|e| SyncError::from_ref(e).should_retry())
        .await;
        let pr = match result {
            Ok(pr) => pr,
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 422 => {
                return Err(SyncError::PrConflict(format!(
                    "PR for head {:?} already exists: {}",
                    params.head, source.message
                )));
            }
            Err(e) => return Err(SyncError::from(e)),
        };

        if !params.labels.is_empty() {
            #[derive(serde::Serialize)]
            struct Labels<'a> {
                labels: &'a [String],
            }
            let labels_route = format!("/repos/{owner}/{name}/issues/{}/labels", pr.number);
            let _: serde::de::IgnoredAny = self
                .client
                .post(&labels_route, Some(&Labels { labels: &params.labels }))
                .await
                .map_err(SyncError::from)?;
        }
        if !params.reviewers.is_empty() || !params.team_reviewers.is_empty() {
            #[derive(serde::Serialize)]
            struct Reviewers<'a> {
                reviewers: &'a [String],
                team_reviewers: &'a [String],
            }
            let reviewers_route = format!("/repos/{owner}/{name}/pulls/{}/requested_reviewers", pr.number);
            let _: serde::de::IgnoredAny = self
                .client
                .post(
                    &reviewers_route,
                    Some(&Reviewers {
                        reviewers: &params.reviewers,
                        team_reviewers: &params.team_reviewers,
                    }),
                )
                .await
                .map_err(SyncError::from)?;
        }
        if !params.assignees.is_empty() {
            #[derive(serde::Serialize)]
            struct Assignees<'a> {
                assignees: &'a [String],
            }
            let assignees_route = format!("/repos/{owner}/{name}/issues/{}/assignees", pr.number);
            let _: serde::de::IgnoredAny = self
                .client
                .post(
                    &assignees_route,
                    Some(&Assignees {
                        assignees: &params.assignees,
                    }),
                )
                .await
                .map_err(SyncError::from)?;
        }
        if params.automerge {
            #[derive(serde::Serialize)]
            struct GraphQlRequest<'a> {
                query: &'a str,
                variables: GraphQlVars<'a>,
            }
            #[derive(serde::Serialize)]
            struct GraphQlVars<'a> {
                id: &'a str,
            }
            const ENABLE_AUTOMERGE: &str = "mutation($id: ID!) { \
                enablePullRequestAutoMerge(input: { pullRequestId: $id }) { clientMutationId } }";
            let _: serde::de::IgnoredAny = self
                .client
                .graphql(&GraphQlRequest {
                    query: ENABLE_AUTOMERGE,
                    variables: GraphQlVars { id: &pr.node_id },
                })
                .await
                .map_err(SyncError::from)?;
        }

        Ok(PullRequest {
            number: pr.number,
            head_branch: pr.head.git_ref,
            html_url: pr.html_url,
            body: pr.body.unwrap_or_default(),
        })
    }

    async fn close_pr(&self, repo: &str, number: u64, comment: Option<&str>, ct: &CancellationToken) -> Result<()> {
        self.guard(ct).await?;
        let (owner, name) = Self::split_repo(repo)?;
        if let Some(comment) = comment {
            #[derive(serde::Serialize)]
            struct Comment<'a> {
                body: &'a str,
            }
            let route = format!("/repos/{owner}/{name}/issues/{number}/comments");
            let _: serde::de::IgnoredAny = self
                .client
                .post(&route, Some(&Comment { body: comment }))
                .await
                .map_err(SyncError::from)?;
        }
        #[derive(serde::Serialize)]
        struct Patch<'a> {
            state: &'a str,
        }
        let route = format!("/repos/{owner}/{name}/pulls/{number}");
        let _: serde::de::IgnoredAny = self
            .client
            .patch(&route, Some(&Patch { state: "closed" }))
            .await
            .map_err(SyncError::from)?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &str, name: &str, ct: &CancellationToken) -> Result<()> {
        self.guard(ct).await?;
        let (owner, repo_name) = Self::split_repo(repo)?;
        let route = format!("/repos/{owner}/{repo_name}/git/refs/heads/{name}");
        self.client
            .delete(&route, None::<&()>)
            .await
            .map_err(SyncError::from)?;
        Ok(())
    }
}

impl SyncError {
    /// Helper so the `backon` `.when()` predicate can classify a borrowed
    /// `octocrab::Error` without consuming it (`.retry()` needs the closure to
    /// return the original error for `notify`/final propagation).
    fn from_ref(err: &octocrab::Error) -> SyncError {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                match status {
                    401 | 403 => SyncError::AuthFailed(source.message.clone()),
                    404 => SyncError::NotFound(source.message.clone()),
                    429 => SyncError::RateLimited {
                        reset_after: DEFAULT_RATE_LIMIT_RESET,
                    },
                    _ => SyncError::TransientNetwork(source.message.clone()),
                }
            }
            _ => SyncError::TransientNetwork(err.to_string()),
        }
    }
}
