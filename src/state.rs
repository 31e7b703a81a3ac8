//! The State Resolver (C6): reconstructs a target's current sync position
//! from forge metadata alone. Nothing here is ever persisted between runs -
//! every field of [`TargetState`] is recomputed from `ListBranches` and
//! `ListOpenPRs` results each time.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::forge::{Forge, PullRequest};
use crate::naming;

/// The source repository's position at the start of a run.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub repo: String,
    pub branch: String,
    pub latest_commit_sha: String,
}

/// A target's derived sync position, or "never synced" if no matching branch
/// exists.
#[derive(Debug, Clone, Default)]
pub struct TargetState {
    pub last_sync_commit_sha: Option<String>,
    pub sync_branch_name: Option<String>,
    pub open_sync_pr: Option<PullRequest>,
}

impl TargetState {
    pub fn never_synced() -> Self {
        Self::default()
    }

    /// §4.6's comparison contract: a necessary (not sufficient) condition for
    /// syncing. The actual decision also depends on whether the computed
    /// ChangeSet ends up non-empty.
    pub fn needs_sync(&self, source: &SourceState) -> bool {
        let source_sha7 = &source.latest_commit_sha[..source.latest_commit_sha.len().min(7)];
        match &self.last_sync_commit_sha {
            Some(last) => last != source_sha7,
            None => true,
        }
    }
}

/// Derives `TargetState` for one target, per §4.6 steps 1-5.
pub async fn resolve_target_state(
    forge: &dyn Forge,
    target_repo: &str,
    branch_prefix: &str,
    group_id: &str,
    ct: &CancellationToken,
) -> Result<TargetState> {
    let prefix = format!("{branch_prefix}-{group_id}-");
    let branches = forge.list_branches(target_repo, &prefix, ct).await?;

    let most_recent = naming::most_recent(branch_prefix, group_id, branches.iter().map(String::as_str));
    let Some((branch_name, parsed)) = most_recent else {
        return Ok(TargetState::never_synced());
    };

    let open_prs = forge.list_open_prs(target_repo, &prefix, ct).await?;
    let open_sync_pr = open_prs.into_iter().find(|pr| pr.head_branch == branch_name);

    Ok(TargetState {
        last_sync_commit_sha: Some(parsed.sha7),
        sync_branch_name: Some(branch_name.to_string()),
        open_sync_pr,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::forge::mock::{MockForge, MockRepo};
    use crate::forge::CreatePrParams;
    use crate::naming::DEFAULT_BRANCH_PREFIX;

    fn ct() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn never_synced_when_no_matching_branch() {
        let forge = MockForge::new();
        forge.seed("org/target", MockRepo::default());
        let state = resolve_target_state(&forge, "org/target", DEFAULT_BRANCH_PREFIX, "core", &ct())
            .await
            .unwrap();
        assert!(state.last_sync_commit_sha.is_none());
        assert!(state.open_sync_pr.is_none());
    }

    #[tokio::test]
    async fn resolves_most_recent_branch_and_its_open_pr() {
        let forge = MockForge::new();
        let mut repo = MockRepo::default();
        let ts1 = Utc.with_ymd_and_hms(2025, 1, 30, 14, 30, 52).unwrap();
        let ts2 = Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap();
        let older = naming::format_branch_name(DEFAULT_BRANCH_PREFIX, "core", ts1, "abc123f");
        let newer = naming::format_branch_name(DEFAULT_BRANCH_PREFIX, "core", ts2, "def4567");
        repo.branches.insert(older.clone(), "sha-older".into());
        repo.branches.insert(newer.clone(), "sha-newer".into());
        forge.seed("org/target", repo);

        let params = CreatePrParams {
            head: newer.clone(),
            ..Default::default()
        };
        forge.create_pr("org/target", &params, &ct()).await.unwrap();

        let state = resolve_target_state(&forge, "org/target", DEFAULT_BRANCH_PREFIX, "core", &ct())
            .await
            .unwrap();
        assert_eq!(state.last_sync_commit_sha, Some("def4567".to_string()));
        assert_eq!(state.sync_branch_name, Some(newer));
        assert!(state.open_sync_pr.is_some());
    }

    #[tokio::test]
    async fn mismatched_group_branches_never_reach_the_parser() {
        let forge = MockForge::new();
        let mut repo = MockRepo::default();
        let ts = Utc.with_ymd_and_hms(2025, 1, 30, 14, 30, 52).unwrap();
        let other_group = naming::format_branch_name(DEFAULT_BRANCH_PREFIX, "other", ts, "abc123f");
        repo.branches.insert(other_group, "sha".into());
        forge.seed("org/target", repo);

        let state = resolve_target_state(&forge, "org/target", DEFAULT_BRANCH_PREFIX, "core", &ct())
            .await
            .unwrap();
        assert!(state.last_sync_commit_sha.is_none());
    }

    #[test]
    fn needs_sync_compares_sha7() {
        let source = SourceState {
            repo: "org/source".into(),
            branch: "main".into(),
            latest_commit_sha: "abc123ffffffffffffffffffffffffffffffff".into(),
        };
        let synced = TargetState {
            last_sync_commit_sha: Some("abc123f".into()),
            sync_branch_name: None,
            open_sync_pr: None,
        };
        assert!(!synced.needs_sync(&source));
        assert!(TargetState::never_synced().needs_sync(&source));
    }
}
