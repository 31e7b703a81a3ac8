//! Orchestrator (C8): drives one sync run end to end. Walks the plan
//! produced by [`crate::scheduler::plan`] layer by layer, and within a
//! layer, group by group; within one group, targets run concurrently
//! (bounded) since they share nothing but the group's resolved source
//! state. A fatal error (`SyncError::is_fatal()`) - auth failure or a
//! config problem surfacing late - cancels the whole run; an ordinary
//! target failure is recorded and the run continues.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Group};
use crate::error::SyncError;
use crate::executor::{self, ExecutionContext, TargetOutcome, TargetResult};
use crate::forge::Forge;
use crate::git::Author;
use crate::resource::Pools;
use crate::scheduler::{self, GroupFilter};
use crate::state::SourceState;
use crate::status::{TargetProgress, Tracker};

impl Clone for ExecutionContext {
    fn clone(&self) -> Self {
        Self {
            forge: self.forge.clone(),
            git_binary: self.git_binary.clone(),
            author: self.author.clone(),
            branch_prefix: self.branch_prefix.clone(),
            dry_run: self.dry_run,
            automerge: self.automerge,
            pools: self.pools.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TargetStatus {
    UpToDate { pr_url: String },
    NoChanges,
    Synced {
        pr_url: String,
        branch: String,
        files_changed: usize,
    },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct TargetReport {
    pub group_id: String,
    pub repo: String,
    pub status: TargetStatus,
    fatal: bool,
}

impl TargetReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, TargetStatus::Failed { .. })
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

fn to_report(group_id: &str, result: TargetResult) -> TargetReport {
    let repo = result.repo;
    match result.outcome {
        Ok(TargetOutcome::UpToDate { pr_url }) => TargetReport {
            group_id: group_id.to_string(),
            repo,
            status: TargetStatus::UpToDate { pr_url },
            fatal: false,
        },
        Ok(TargetOutcome::NoChanges) => TargetReport {
            group_id: group_id.to_string(),
            repo,
            status: TargetStatus::NoChanges,
            fatal: false,
        },
        Ok(TargetOutcome::Synced { pr_url, branch, files_changed }) => TargetReport {
            group_id: group_id.to_string(),
            repo,
            status: TargetStatus::Synced { pr_url, branch, files_changed },
            fatal: false,
        },
        Err(err) => {
            let fatal = err.is_fatal();
            TargetReport {
                group_id: group_id.to_string(),
                repo,
                status: TargetStatus::Failed { error: err.to_string() },
                fatal,
            }
        }
    }
}

impl From<&TargetReport> for TargetProgress {
    fn from(report: &TargetReport) -> Self {
        match &report.status {
            TargetStatus::UpToDate { .. } => TargetProgress::UpToDate,
            TargetStatus::NoChanges => TargetProgress::NoChanges,
            TargetStatus::Synced { pr_url, .. } => TargetProgress::Synced { pr_url: pr_url.clone() },
            TargetStatus::Failed { error } => TargetProgress::Failed { error: error.clone() },
        }
    }
}

/// Outcome of a full sync run across every planned layer.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub reports: Vec<TargetReport>,
    /// Set when a fatal error cut the run short; remaining layers were
    /// never attempted.
    pub aborted: bool,
}

impl RunResult {
    pub fn success(&self) -> bool {
        !self.aborted && self.reports.iter().all(|r| !r.is_failure())
    }

    /// 0 on full success, 1 if any target failed, 2 on a fatal/config-level
    /// abort - matching the CLI's exit code contract.
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            2
        } else if self.reports.iter().any(|r| r.is_failure()) {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    pub forge: Arc<dyn Forge>,
    pub git_binary: PathBuf,
    pub author: Author,
    pub branch_prefix: String,
    pub dry_run: bool,
    pub automerge: bool,
    pub max_parallel_targets: usize,
    pub pools: Arc<Pools>,
}

impl Orchestrator {
    fn execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            forge: self.forge.clone(),
            git_binary: self.git_binary.clone(),
            author: self.author.clone(),
            branch_prefix: self.branch_prefix.clone(),
            dry_run: self.dry_run,
            automerge: self.automerge,
            pools: self.pools.clone(),
        }
    }

    pub async fn run(
        &self,
        config: &Config,
        filter: &GroupFilter,
        repos: &[String],
        ct: CancellationToken,
        progress: Option<&mut Tracker<Box<dyn std::io::Write + Send>>>,
    ) -> RunResult {
        let plan = scheduler::plan(config, filter);
        let exec_ctx = self.execution_context();
        let mut result = RunResult::default();

        if let Some(tracker) = progress {
            for layer in &plan {
                for group in layer {
                    let targets = scheduler::filter_targets(&group.targets, repos);
                    let target_repos: Vec<String> = targets.iter().map(|t| t.repo.clone()).collect();
                    tracker.register_group(&group.id, &group.name, &target_repos);
                }
            }
            let _ = tracker.repaint();

            'outer: for layer in &plan {
                for group in layer {
                    if ct.is_cancelled() {
                        result.aborted = true;
                        break 'outer;
                    }
                    let reports = self.run_group(&exec_ctx, group, repos, &ct).await;
                    for report in &reports {
                        tracker.update(&group.id, &report.repo, TargetProgress::from(report));
                    }
                    let _ = tracker.repaint();
                    let fatal = reports.iter().any(|r| r.is_fatal());
                    result.reports.extend(reports);
                    if fatal {
                        ct.cancel();
                        result.aborted = true;
                        break 'outer;
                    }
                }
            }
            return result;
        }

        'outer_noprogress: for layer in &plan {
            for group in layer {
                if ct.is_cancelled() {
                    result.aborted = true;
                    break 'outer_noprogress;
                }
                let reports = self.run_group(&exec_ctx, group, repos, &ct).await;
                let fatal = reports.iter().any(|r| r.is_fatal());
                result.reports.extend(reports);
                if fatal {
                    ct.cancel();
                    result.aborted = true;
                    break 'outer_noprogress;
                }
            }
        }
        result
    }

    async fn run_group(
        &self,
        exec_ctx: &ExecutionContext,
        group: &Group,
        repos: &[String],
        ct: &CancellationToken,
    ) -> Vec<TargetReport> {
        let targets = scheduler::filter_targets(&group.targets, repos);

        let latest_commit_sha = match self
            .forge
            .get_latest_commit(&group.source.repo, &group.source.branch, ct)
            .await
        {
            Ok(sha) => sha,
            Err(err) => {
                let fatal = err.is_fatal();
                return targets
                    .iter()
                    .map(|t| TargetReport {
                        group_id: group.id.clone(),
                        repo: t.repo.clone(),
                        status: TargetStatus::Failed { error: err.to_string() },
                        fatal,
                    })
                    .collect();
            }
        };
        let source = SourceState {
            repo: group.source.repo.clone(),
            branch: group.source.branch.clone(),
            latest_commit_sha,
        };

        let sem = Arc::new(Semaphore::new(self.max_parallel_targets.max(1)));
        let mut set = JoinSet::new();
        for target in &targets {
            let sem = sem.clone();
            let exec_ctx = exec_ctx.clone();
            let target = (*target).clone();
            let group = group.clone();
            let source = source.clone();
            let ct = ct.clone();
            set.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                executor::sync_target(&exec_ctx, &group, &target, &source, &ct).await
            });
        }

        let mut reports = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            let target_result = match joined {
                Ok(r) => r,
                Err(join_err) => TargetResult {
                    repo: "(unknown)".to_string(),
                    outcome: Err(SyncError::Panicked(join_err.to_string())),
                },
            };
            reports.push(to_report(&group.id, target_result));
        }
        reports
    }
}
