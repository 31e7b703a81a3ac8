//! Cancel Controller (C10): tears down in-flight sync artifacts for one or
//! more groups - closes any open sync PRs, then (unless asked to keep them)
//! deletes the backing branches. Runs in reverse order from the executor:
//! PR first, branch second, since a branch with no PR is harmless but an
//! open PR pointing at a deleted branch is confusing to whoever finds it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, Group};
use crate::error::Result;
use crate::forge::Forge;
use crate::scheduler::{self, GroupFilter};

#[derive(Debug, Clone)]
pub struct CancelOptions {
    pub branch_prefix: String,
    pub dry_run: bool,
    pub keep_branches: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TargetCancelOutcome {
    /// No sync branch/PR existed for this target; nothing to do.
    NothingToCancel,
    Cancelled {
        closed_pr: Option<u64>,
        deleted_branch: Option<String>,
    },
}

#[derive(Debug)]
pub struct TargetCancelResult {
    pub repo: String,
    pub outcome: Result<TargetCancelOutcome>,
}

pub struct CancelController {
    pub forge: Arc<dyn Forge>,
    pub options: CancelOptions,
}

impl CancelController {
    /// Cancels every target in `group` matching `repos` (empty means every
    /// target), in target declaration order.
    async fn cancel_group(
        &self,
        group: &Group,
        repos: &[String],
        ct: &CancellationToken,
    ) -> Vec<TargetCancelResult> {
        let targets = scheduler::filter_targets(&group.targets, repos);
        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            let outcome = self.cancel_target(&group.id, &target.repo, ct).await;
            results.push(TargetCancelResult {
                repo: target.repo.clone(),
                outcome,
            });
        }
        results
    }

    async fn cancel_target(
        &self,
        group_id: &str,
        target_repo: &str,
        ct: &CancellationToken,
    ) -> Result<TargetCancelOutcome> {
        let prefix = format!("{}-{}", self.options.branch_prefix, group_id);
        let open_prs = self.forge.list_open_prs(target_repo, &prefix, ct).await?;
        let branches = self.forge.list_branches(target_repo, &prefix, ct).await?;

        if open_prs.is_empty() && branches.is_empty() {
            return Ok(TargetCancelOutcome::NothingToCancel);
        }

        let mut closed_pr = None;
        for pr in &open_prs {
            log::info!(
                "cancel: closing PR #{} on {} (branch {})",
                pr.number,
                target_repo,
                pr.head_branch
            );
            if !self.options.dry_run {
                self.forge
                    .close_pr(target_repo, pr.number, self.options.comment.as_deref(), ct)
                    .await?;
            }
            closed_pr = Some(pr.number);
        }

        let mut deleted_branch = None;
        if !self.options.keep_branches {
            for branch in &branches {
                log::info!("cancel: deleting branch {branch} on {target_repo}");
                if !self.options.dry_run {
                    self.forge.delete_branch(target_repo, branch, ct).await?;
                }
                deleted_branch = Some(branch.clone());
            }
        }

        Ok(TargetCancelOutcome::Cancelled {
            closed_pr,
            deleted_branch,
        })
    }

    /// Cancels every enabled, filter-matching group in `config`. Groups run
    /// sequentially - cancellation isn't performance sensitive and keeping
    /// it simple makes log output easy to follow.
    pub async fn cancel_all(
        &self,
        config: &Config,
        filter: &GroupFilter,
        repos: &[String],
        ct: &CancellationToken,
    ) -> Vec<(String, Vec<TargetCancelResult>)> {
        let mut out = Vec::new();
        for layer in config.groups.layers() {
            for group in layer {
                if !group.enabled || !filter_matches(filter, group) {
                    continue;
                }
                if ct.is_cancelled() {
                    return out;
                }
                let results = self.cancel_group(group, repos, ct).await;
                out.push((group.id.clone(), results));
            }
        }
        out
    }
}

fn filter_matches(filter: &GroupFilter, group: &Group) -> bool {
    let selector_matches = |s: &str| s == group.id || s == group.name;
    if !filter.only.is_empty() && !filter.only.iter().any(|s| selector_matches(s)) {
        return false;
    }
    if filter.skip.iter().any(|s| selector_matches(s)) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::parse;
    use crate::forge::mock::{MockForge, MockRepo};
    use crate::forge::PullRequest;

    fn config() -> Config {
        parse(
            r#"
version: 1
groups:
  - name: Core
    id: core
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/t1
        files: [{src: a.yml, dest: a.yml}]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn closes_open_pr_and_deletes_branch() {
        let forge = Arc::new(MockForge::new());
        let mut repo = MockRepo::default();
        repo.branches.insert(
            "chore/sync-files-core-20250101-000000-abc1234".to_string(),
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        );
        repo.open_prs.push(PullRequest {
            number: 7,
            head_branch: "chore/sync-files-core-20250101-000000-abc1234".to_string(),
            html_url: "https://example.com/pr/7".to_string(),
            body: String::new(),
        });
        forge.seed("org/t1", repo);

        let controller = CancelController {
            forge: forge.clone(),
            options: CancelOptions {
                branch_prefix: "chore/sync-files".to_string(),
                dry_run: false,
                keep_branches: false,
                comment: Some("cancelled".to_string()),
            },
        };

        let config = config();
        let results = controller
            .cancel_all(&config, &GroupFilter::default(), &[], &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        let (_, target_results) = &results[0];
        assert_eq!(target_results.len(), 1);
        match &target_results[0].outcome {
            Ok(TargetCancelOutcome::Cancelled { closed_pr, deleted_branch }) => {
                assert_eq!(*closed_pr, Some(7));
                assert!(deleted_branch.is_some());
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }

        let snapshot = forge.snapshot("org/t1").unwrap();
        assert!(snapshot.open_prs.is_empty());
        assert!(snapshot.branches.is_empty());
    }

    #[tokio::test]
    async fn dry_run_leaves_remote_state_untouched() {
        let forge = Arc::new(MockForge::new());
        let mut repo = MockRepo::default();
        repo.branches.insert(
            "chore/sync-files-core-20250101-000000-abc1234".to_string(),
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        );
        forge.seed("org/t1", repo);

        let controller = CancelController {
            forge: forge.clone(),
            options: CancelOptions {
                branch_prefix: "chore/sync-files".to_string(),
                dry_run: true,
                keep_branches: false,
                comment: None,
            },
        };

        let config = config();
        controller
            .cancel_all(&config, &GroupFilter::default(), &[], &CancellationToken::new())
            .await;

        let snapshot = forge.snapshot("org/t1").unwrap();
        assert_eq!(snapshot.branches.len(), 1);
    }

    #[tokio::test]
    async fn keep_branches_skips_branch_deletion() {
        let forge = Arc::new(MockForge::new());
        let mut repo = MockRepo::default();
        repo.branches.insert(
            "chore/sync-files-core-20250101-000000-abc1234".to_string(),
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        );
        repo.open_prs.push(PullRequest {
            number: 1,
            head_branch: "chore/sync-files-core-20250101-000000-abc1234".to_string(),
            html_url: "https://example.com/pr/1".to_string(),
            body: String::new(),
        });
        forge.seed("org/t1", repo);

        let controller = CancelController {
            forge: forge.clone(),
            options: CancelOptions {
                branch_prefix: "chore/sync-files".to_string(),
                dry_run: false,
                keep_branches: true,
                comment: None,
            },
        };

        let config = config();
        controller
            .cancel_all(&config, &GroupFilter::default(), &[], &CancellationToken::new())
            .await;

        let snapshot = forge.snapshot("org/t1").unwrap();
        assert!(snapshot.open_prs.is_empty());
        assert_eq!(snapshot.branches.len(), 1);
    }

    #[tokio::test]
    async fn repos_filter_narrows_to_named_targets() {
        let config = parse(
            r#"
version: 1
groups:
  - name: Core
    id: core
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/t1
        files: [{src: a.yml, dest: a.yml}]
      - repo: org/t2
        files: [{src: a.yml, dest: a.yml}]
"#,
        )
        .unwrap();

        let forge = Arc::new(MockForge::new());
        for repo_name in ["org/t1", "org/t2"] {
            let mut repo = MockRepo::default();
            repo.branches.insert(
                "chore/sync-files-core-20250101-000000-abc1234".to_string(),
                "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
            );
            forge.seed(repo_name, repo);
        }

        let controller = CancelController {
            forge: forge.clone(),
            options: CancelOptions {
                branch_prefix: "chore/sync-files".to_string(),
                dry_run: false,
                keep_branches: false,
                comment: None,
            },
        };

        let results = controller
            .cancel_all(
                &config,
                &GroupFilter::default(),
                &["org/t1".to_string()],
                &CancellationToken::new(),
            )
            .await;

        let (_, target_results) = &results[0];
        assert_eq!(target_results.len(), 1);
        assert_eq!(target_results[0].repo, "org/t1");

        assert!(forge.snapshot("org/t1").unwrap().branches.is_empty());
        assert_eq!(forge.snapshot("org/t2").unwrap().branches.len(), 1);
    }
}
