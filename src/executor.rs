//! Target Sync Executor (C7): the sync pipeline for a single target, run
//! start to finish - resolve state, build the desired file set, diff against
//! the target, and (if anything changed) commit, push, and open a PR.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::{DirectoryMapping, FileMapping, Group, Target};
use crate::diff::{classify, is_binary, ChangeKind};
use crate::error::{Result, SyncError};
use crate::exclude::ExclusionMatcher;
use crate::forge::{CreatePrParams, Forge};
use crate::git::{Author, TempWorktree, Worktree};
use crate::naming::{self, DirectoryMetadata, FileMetadata, PrMetadata};
use crate::resource::{CacheKey, Pools};
use crate::state::{self, SourceState};
use crate::transform::{self, TransformContext};

#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub dest: String,
    pub bytes: Option<Vec<u8>>,
}

/// Everything an executor run needs that's shared across targets in one run.
pub struct ExecutionContext {
    pub forge: Arc<dyn Forge>,
    pub git_binary: PathBuf,
    pub author: Author,
    pub branch_prefix: String,
    pub dry_run: bool,
    pub automerge: bool,
    pub pools: Arc<Pools>,
}

#[derive(Debug, Clone)]
pub enum TargetOutcome {
    /// An open PR already reflects the current source commit; nothing done.
    UpToDate { pr_url: String },
    /// The computed ChangeSet was empty; no branch or PR was produced.
    NoChanges,
    /// A new PR (or dry-run plan) was produced.
    Synced {
        pr_url: String,
        branch: String,
        files_changed: usize,
    },
}

#[derive(Debug)]
pub struct TargetResult {
    pub repo: String,
    pub outcome: Result<TargetOutcome>,
}

fn join_path(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Fetches one source file's bytes, consulting the run's `ReadCache` first.
/// Only source reads go through the cache: a group's targets commonly pull
/// the same source path, and the source tree can't change mid-run.
async fn fetch_source_bytes(
    ctx: &ExecutionContext,
    repo: &str,
    git_ref: &str,
    path: &str,
    ct: &CancellationToken,
) -> Result<Option<Arc<Vec<u8>>>> {
    let key = CacheKey::new(repo, git_ref, path);
    if let Some(cached) = ctx.pools.read_cache.get(&key) {
        return Ok(Some(cached));
    }
    let bytes = ctx.forge.get_file_content(repo, git_ref, path, ct).await?;
    Ok(bytes.map(|b| {
        let arc = Arc::new(b);
        ctx.pools.read_cache.insert(key, arc.clone());
        arc
    }))
}

/// Copies `bytes` into a pool-backed scratch buffer sized to fit, applies
/// `transforms` against it, and returns the transformed output. Binary
/// content skips transforms entirely per §4.3.
fn transform_via_scratch(
    ctx: &ExecutionContext,
    bytes: &[u8],
    transforms: &[transform::Transform],
    tctx: &TransformContext<'_>,
) -> Vec<u8> {
    let mut scratch = ctx.pools.buffers.acquire(bytes.len());
    scratch.as_mut().extend_from_slice(bytes);
    if is_binary(scratch.as_slice()) {
        scratch.as_slice().to_vec()
    } else {
        transform::apply(transforms, scratch.as_slice(), tctx)
    }
}

async fn build_file_mapping_change(
    ctx: &ExecutionContext,
    source: &SourceState,
    target_repo: &str,
    target_branch: &str,
    mapping: &FileMapping,
    transforms: &[transform::Transform],
    tctx: &TransformContext<'_>,
    ct: &CancellationToken,
) -> Result<Option<ChangeEntry>> {
    if mapping.delete {
        let current = ctx
            .forge
            .get_file_content(target_repo, target_branch, &mapping.dest, ct)
            .await?;
        return Ok(current.map(|_| ChangeEntry {
            kind: ChangeKind::Deleted,
            dest: mapping.dest.clone(),
            bytes: None,
        }));
    }

    let src_path = mapping
        .src
        .as_deref()
        .expect("validated config guarantees src unless delete=true");
    let Some(source_bytes) = fetch_source_bytes(ctx, &source.repo, &source.branch, src_path, ct).await? else {
        log::warn!("source file {src_path:?} not found at {}", source.branch);
        return Ok(None);
    };

    let transformed = transform_via_scratch(ctx, &source_bytes, transforms, tctx);

    let current = ctx
        .forge
        .get_file_content(target_repo, target_branch, &mapping.dest, ct)
        .await?;
    Ok(classify(&transformed, current.as_deref()).map(|kind| ChangeEntry {
        kind,
        dest: mapping.dest.clone(),
        bytes: Some(transformed),
    }))
}

async fn build_directory_mapping_changes(
    ctx: &ExecutionContext,
    source: &SourceState,
    target_repo: &str,
    target_branch: &str,
    mapping: &DirectoryMapping,
    tctx: &TransformContext<'_>,
    ct: &CancellationToken,
) -> Result<Vec<ChangeEntry>> {
    if mapping.delete {
        let entries = ctx
            .forge
            .list_tree(target_repo, target_branch, &mapping.dest, true, ct)
            .await?;
        return Ok(entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| ChangeEntry {
                kind: ChangeKind::Deleted,
                dest: e.path,
                bytes: None,
            })
            .collect());
    }

    let matcher = ExclusionMatcher::new(&mapping.excludes, mapping.include_hidden)
        .map_err(|e| SyncError::ConfigInvalid(format!("building exclusion matcher: {e}")))?;
    let source_entries = ctx
        .forge
        .list_tree(&source.repo, &source.branch, &mapping.src, true, ct)
        .await?;
    let src_prefix = format!("{}/", mapping.src.trim_end_matches('/'));
    let rel_paths: Vec<String> = source_entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .filter_map(|e| e.path.strip_prefix(&src_prefix).map(str::to_string))
        .collect();
    let rel_refs: Vec<&str> = rel_paths.iter().map(String::as_str).collect();
    let wanted = matcher.filter(rel_refs);

    let mut changes = Vec::new();
    for rel in wanted {
        let src_path = join_path(&mapping.src, rel);
        let dest_path = if mapping.preserve_structure {
            join_path(&mapping.dest, rel)
        } else {
            join_path(&mapping.dest, basename(rel))
        };

        let Some(source_bytes) = fetch_source_bytes(ctx, &source.repo, &source.branch, &src_path, ct).await? else {
            continue;
        };
        let transformed = transform_via_scratch(ctx, &source_bytes, &mapping.transforms, tctx);
        let current = ctx
            .forge
            .get_file_content(target_repo, target_branch, &dest_path, ct)
            .await?;
        if let Some(kind) = classify(&transformed, current.as_deref()) {
            changes.push(ChangeEntry {
                kind,
                dest: dest_path,
                bytes: Some(transformed),
            });
        }
    }
    Ok(changes)
}

async fn build_changeset(
    ctx: &ExecutionContext,
    group: &Group,
    source: &SourceState,
    target: &Target,
    ct: &CancellationToken,
) -> Result<Vec<ChangeEntry>> {
    let target_branch = target
        .branch
        .clone()
        .expect("target branch resolved before changeset computation");

    let mut variables = std::collections::HashMap::new();
    variables.insert("SOURCE_REPO".to_string(), source.repo.clone());
    variables.insert("SOURCE_BRANCH".to_string(), source.branch.clone());
    variables.insert("TARGET_REPO".to_string(), target.repo.clone());
    variables.insert("TARGET_BRANCH".to_string(), target_branch.clone());
    variables.insert("GROUP_ID".to_string(), group.id.clone());
    variables.insert("GROUP_NAME".to_string(), group.name.clone());
    let tctx = TransformContext {
        variables: &variables,
        source_repo: &source.repo,
        target_repo: &target.repo,
    };

    let mut changes = Vec::new();
    for mapping in &target.file_mappings {
        if let Some(change) = build_file_mapping_change(
            ctx,
            source,
            &target.repo,
            &target_branch,
            mapping,
            &target.transforms,
            &tctx,
            ct,
        )
        .await?
        {
            changes.push(change);
        }
    }
    for mapping in &target.directory_mappings {
        changes.extend(
            build_directory_mapping_changes(ctx, source, &target.repo, &target_branch, mapping, &tctx, ct).await?,
        );
    }
    Ok(changes)
}

fn pr_body(group: &Group, target: &Target, source: &SourceState, branch: &str, changes: &[ChangeEntry]) -> String {
    let files = changes
        .iter()
        .map(|c| FileMetadata {
            path: c.dest.clone(),
            kind: c.kind.as_str().to_string(),
        })
        .collect();
    let meta = PrMetadata {
        group_id: group.id.clone(),
        group_name: group.name.clone(),
        source_repo: source.repo.clone(),
        source_branch: source.branch.clone(),
        source_commit: source.latest_commit_sha.clone(),
        files,
        directories: target
            .directory_mappings
            .iter()
            .map(|dm| DirectoryMetadata {
                src: dm.src.clone(),
                dest: dm.dest.clone(),
                files_synced: changes.iter().filter(|c| c.dest.starts_with(&dm.dest)).count(),
            })
            .collect(),
        performance: None,
        timestamp: Utc::now(),
    };
    format!(
        "Automated sync from `{}` (`{}`) on branch `{branch}`.\n\n{}\n",
        source.repo,
        &source.latest_commit_sha[..source.latest_commit_sha.len().min(7)],
        meta.to_block()
    )
}

/// Runs the full pipeline for one target. Never panics on ordinary failures:
/// anything that goes wrong is captured in the returned `TargetResult` so the
/// orchestrator can aggregate it rather than aborting the whole run.
pub async fn sync_target(
    ctx: &ExecutionContext,
    group: &Group,
    target: &Target,
    source: &SourceState,
    ct: &CancellationToken,
) -> TargetResult {
    let repo = target.repo.clone();
    let outcome = sync_target_inner(ctx, group, target, source, ct).await;
    TargetResult { repo, outcome }
}

async fn sync_target_inner(
    ctx: &ExecutionContext,
    group: &Group,
    target: &Target,
    source: &SourceState,
    ct: &CancellationToken,
) -> Result<TargetOutcome> {
    let target_branch = match &target.branch {
        Some(b) => b.clone(),
        None => ctx.forge.get_default_branch(&target.repo, ct).await?,
    };

    let target_state = state::resolve_target_state(
        ctx.forge.as_ref(),
        &target.repo,
        &ctx.branch_prefix,
        &group.id,
        ct,
    )
    .await?;

    let source_sha7 = &source.latest_commit_sha[..source.latest_commit_sha.len().min(7)];
    if let (Some(last), Some(pr)) = (&target_state.last_sync_commit_sha, &target_state.open_sync_pr) {
        if last == source_sha7 {
            return Ok(TargetOutcome::UpToDate {
                pr_url: pr.html_url.clone(),
            });
        }
    }

    let mut target = target.clone();
    target.branch = Some(target_branch.clone());
    let changes = build_changeset(ctx, group, source, &target, ct).await?;
    if changes.is_empty() {
        return Ok(TargetOutcome::NoChanges);
    }

    let branch_name = naming::format_branch_name(&ctx.branch_prefix, &group.id, Utc::now(), source_sha7);

    if ctx.dry_run {
        log::info!(
            "dry-run: would push {} file change(s) to {} as {branch_name}",
            changes.len(),
            target.repo
        );
        return Ok(TargetOutcome::Synced {
            pr_url: "(dry-run, no PR opened)".to_string(),
            branch: branch_name,
            files_changed: changes.len(),
        });
    }

    let temp_dir = TempDir::with_prefix("filesync-").map_err(SyncError::from)?;
    let repo_url = format!("https://github.com/{}.git", target.repo);
    let worktree = TempWorktree::clone_remote(ct, &ctx.git_binary, &repo_url, &target_branch, temp_dir)
        .await
        .map_err(|e| SyncError::GitLocal(e.to_string()))?;

    let result = apply_and_push(ctx, &worktree, group, &mut target, source, &branch_name, &changes, ct).await;
    worktree.cleanup().await;
    result
}

async fn apply_and_push(
    ctx: &ExecutionContext,
    worktree: &TempWorktree,
    group: &Group,
    target: &mut Target,
    source: &SourceState,
    branch_name: &str,
    changes: &[ChangeEntry],
    ct: &CancellationToken,
) -> Result<TargetOutcome> {
    worktree
        .checkout_new_branch(branch_name, "HEAD")
        .await
        .map_err(|e| SyncError::GitLocal(e.to_string()))?;

    for change in changes {
        match change.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                worktree
                    .write_file(&change.dest, change.bytes.as_deref().unwrap_or_default())
                    .await
                    .map_err(|e| SyncError::GitLocal(e.to_string()))?;
            }
            ChangeKind::Deleted => {
                worktree
                    .delete_path(&change.dest)
                    .await
                    .map_err(|e| SyncError::GitLocal(e.to_string()))?;
            }
        }
    }

    let message = format!("sync: update {} files from source repository", changes.len());
    worktree
        .commit_all(&message, &ctx.author)
        .await
        .map_err(|e| SyncError::GitLocal(e.to_string()))?;
    worktree
        .push("origin", branch_name, ct)
        .await
        .map_err(|e| SyncError::GitLocal(e.to_string()))?;

    let target_branch = target.branch.clone().expect("resolved before worktree acquisition");
    let params = CreatePrParams {
        title: format!("Sync files from {} ({})", source.repo, group.name),
        body: pr_body(group, target, source, branch_name, changes),
        head: branch_name.to_string(),
        base: target_branch,
        labels: target.pr_sets.labels.clone(),
        assignees: target.pr_sets.assignees.clone(),
        reviewers: target.pr_sets.reviewers.clone(),
        team_reviewers: target.pr_sets.team_reviewers.clone(),
        automerge: ctx.automerge,
    };

    match ctx.forge.create_pr(&target.repo, &params, ct).await {
        Ok(pr) => Ok(TargetOutcome::Synced {
            pr_url: pr.html_url,
            branch: branch_name.to_string(),
            files_changed: changes.len(),
        }),
        Err(SyncError::PrConflict(msg)) => {
            log::warn!("{msg}");
            let existing = ctx
                .forge
                .list_open_prs(&target.repo, &ctx.branch_prefix, ct)
                .await?
                .into_iter()
                .find(|pr| pr.head_branch == branch_name);
            Ok(TargetOutcome::UpToDate {
                pr_url: existing.map(|pr| pr.html_url).unwrap_or(msg),
            })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::parse;
    use crate::forge::mock::{MockForge, MockRepo};
    use crate::forge::TreeEntry;
    use crate::resource::Pools;

    fn ct() -> CancellationToken {
        CancellationToken::new()
    }

    fn test_context(forge: MockForge) -> ExecutionContext {
        ExecutionContext {
            forge: Arc::new(forge),
            git_binary: PathBuf::from("/usr/bin/git"),
            author: Author {
                name: "filesync".into(),
                email: "filesync@example.invalid".into(),
            },
            branch_prefix: naming::DEFAULT_BRANCH_PREFIX.to_string(),
            dry_run: true,
            automerge: false,
            pools: Arc::new(Pools::new()),
        }
    }

    fn config_yaml() -> &'static str {
        r#"
version: 1
groups:
  - name: Core
    id: core
    priority: 0
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/target
        branch: main
        files:
          - {src: a.yml, dest: a.yml}
"#
    }

    #[tokio::test]
    async fn no_changes_when_bytes_already_match() {
        let forge = MockForge::new();
        let mut source_repo = MockRepo::default();
        source_repo
            .files
            .insert(("main".into(), "a.yml".into()), b"content".to_vec());
        forge.seed("org/source", source_repo);
        let mut target_repo = MockRepo::default();
        target_repo
            .files
            .insert(("main".into(), "a.yml".into()), b"content".to_vec());
        forge.seed("org/target", target_repo);

        let config = parse(config_yaml()).unwrap();
        let group = config.groups.node(&"core".to_string()).unwrap();
        let target = &group.targets[0];
        let source = SourceState {
            repo: "org/source".into(),
            branch: "main".into(),
            latest_commit_sha: "abc123fffffffffffffffffffffffffffffff".into(),
        };
        let ctx = test_context(forge);
        let result = sync_target(&ctx, group, target, &source, &ct()).await;
        assert!(matches!(result.outcome, Ok(TargetOutcome::NoChanges)));
    }

    #[tokio::test]
    async fn dry_run_reports_synced_without_touching_git() {
        let forge = MockForge::new();
        let mut source_repo = MockRepo::default();
        source_repo
            .files
            .insert(("main".into(), "a.yml".into()), b"new content".to_vec());
        forge.seed("org/source", source_repo);
        forge.seed("org/target", MockRepo::default());

        let config = parse(config_yaml()).unwrap();
        let group = config.groups.node(&"core".to_string()).unwrap();
        let target = &group.targets[0];
        let source = SourceState {
            repo: "org/source".into(),
            branch: "main".into(),
            latest_commit_sha: "abc123fffffffffffffffffffffffffffffff".into(),
        };
        let ctx = test_context(forge);
        let result = sync_target(&ctx, group, target, &source, &ct()).await;
        match result.outcome.unwrap() {
            TargetOutcome::Synced { files_changed, .. } => assert_eq!(files_changed, 1),
            other => panic!("expected Synced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_mapping_respects_exclusions() {
        let forge = MockForge::new();
        let mut source_repo = MockRepo::default();
        source_repo.trees.insert(
            "main".into(),
            vec![
                TreeEntry { path: "dir/a.yml".into(), is_dir: false },
                TreeEntry { path: "dir/skip.out".into(), is_dir: false },
            ],
        );
        source_repo
            .files
            .insert(("main".into(), "dir/a.yml".into()), b"hi".to_vec());
        forge.seed("org/source", source_repo);
        forge.seed("org/target", MockRepo::default());

        let config = parse(
            r#"
version: 1
groups:
  - name: Core
    id: core
    priority: 0
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/target
        branch: main
        directories:
          - {src: dir, dest: dir}
"#,
        )
        .unwrap();
        let group = config.groups.node(&"core".to_string()).unwrap();
        let target = &group.targets[0];
        let source = SourceState {
            repo: "org/source".into(),
            branch: "main".into(),
            latest_commit_sha: "abc123fffffffffffffffffffffffffffffff".into(),
        };
        let ctx = test_context(forge);
        let result = sync_target(&ctx, group, target, &source, &ct()).await;
        match result.outcome.unwrap() {
            TargetOutcome::Synced { files_changed, .. } => assert_eq!(files_changed, 1),
            other => panic!("expected Synced, got {other:?}"),
        }
    }
}
