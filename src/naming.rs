//! Bit-exact branch naming and PR metadata block formats, shared by the State
//! Resolver (C6), the Target Sync Executor (C7) and the Cancel Controller
//! (C10) - all three must agree on exactly the same format or state recovery
//! breaks.

use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BRANCH_PREFIX: &str = "chore/sync-files";
const METADATA_BEGIN: &str = "<!-- go-broadcast metadata";
const METADATA_END: &str = "-->";

/// A parsed sync branch name: `{prefix}-{group_id}-{YYYYMMDD-HHMMSS}-{sha7}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBranch {
    pub timestamp: NaiveDateTime,
    pub sha7: String,
}

/// Compiles the branch-name regex for one `(prefix, group_id)` pair. Group ids
/// are embedded in the prefix passed to `ListBranches` precisely so that this
/// regex - and the remote list call upstream of it - never has to look at
/// branches belonging to other groups.
pub fn branch_regex(branch_prefix: &str, group_id: &str) -> Regex {
    // group_id/branch_prefix come from validated config (alphanumeric + hyphens,
    // checked at load time) so literal interpolation here is safe.
    Regex::new(&format!(
        r"^{}-{}-(\d{{8}}-\d{{6}})-([0-9a-f]{{7}})$",
        regex::escape(branch_prefix),
        regex::escape(group_id)
    ))
    .expect("branch regex is always valid")
}

pub fn format_branch_name(
    branch_prefix: &str,
    group_id: &str,
    timestamp: DateTime<Utc>,
    sha7: &str,
) -> String {
    format!(
        "{}-{}-{}-{}",
        branch_prefix,
        group_id,
        timestamp.format("%Y%m%d-%H%M%S"),
        sha7
    )
}

pub fn parse_branch_name(branch_prefix: &str, group_id: &str, name: &str) -> Option<ParsedBranch> {
    let re = branch_regex(branch_prefix, group_id);
    let caps = re.captures(name)?;
    let timestamp = NaiveDateTime::parse_from_str(&caps[1], "%Y%m%d-%H%M%S").ok()?;
    Some(ParsedBranch {
        timestamp,
        sha7: caps[2].to_string(),
    })
}

/// Select the most recently created matching branch: the one with the largest
/// timestamp. Timestamps are generated by this tool and are monotonic per
/// target within a run, so lexicographic comparison of the formatted string
/// suffices and we don't need to worry about clock skew across runs.
pub fn most_recent<'a>(
    branch_prefix: &str,
    group_id: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Option<(&'a str, ParsedBranch)> {
    names
        .into_iter()
        .filter_map(|name| parse_branch_name(branch_prefix, group_id, name).map(|p| (name, p)))
        .max_by_key(|(_, p)| p.timestamp)
}

/// The structured, round-trip-parseable block embedded in every sync PR body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrMetadata {
    pub group_id: String,
    pub group_name: String,
    pub source_repo: String,
    pub source_branch: String,
    pub source_commit: String,
    pub files: Vec<FileMetadata>,
    #[serde(default)]
    pub directories: Vec<DirectoryMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetadata>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub path: String,
    pub kind: String, // "added" | "modified" | "deleted"
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryMetadata {
    pub src: String,
    pub dest: String,
    pub files_synced: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetadata {
    pub duration_ms: u64,
    pub bytes_transferred: u64,
}

impl PrMetadata {
    /// Render this metadata as the HTML-comment block to embed (verbatim) in a
    /// PR body, plus whatever human-readable summary precedes it.
    pub fn to_block(&self) -> String {
        let yaml = serde_yaml::to_string(self).expect("PrMetadata always serializes");
        format!("{METADATA_BEGIN}\n{yaml}{METADATA_END}")
    }

    /// Parse the metadata block out of a full PR body. Returns `None` if the
    /// delimiters are missing or the content between them doesn't parse -
    /// both are treated identically by callers (the PR is not one of ours, or
    /// is corrupt, either way we don't claim ownership of it).
    pub fn from_body(body: &str) -> Option<Self> {
        let start = body.find(METADATA_BEGIN)?;
        let after_begin = start + METADATA_BEGIN.len();
        let end_rel = body[after_begin..].find(METADATA_END)?;
        let yaml = &body[after_begin..after_begin + end_rel];
        serde_yaml::from_str(yaml).ok()
    }
}

lazy_static! {
    static ref GROUP_ID_RE: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
}

/// Validates a group id against the `alphanumeric with hyphens, lowercase`
/// constraint that branch naming depends on.
pub fn is_valid_group_id(id: &str) -> bool {
    GROUP_ID_RE.is_match(id)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn branch_name_round_trips() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 30, 14, 30, 52).unwrap();
        let name = format_branch_name(DEFAULT_BRANCH_PREFIX, "core", ts, "abc123f");
        assert_eq!(name, "chore/sync-files-core-20250130-143052-abc123f");
        let parsed = parse_branch_name(DEFAULT_BRANCH_PREFIX, "core", &name).unwrap();
        assert_eq!(parsed.sha7, "abc123f");
        assert_eq!(parsed.timestamp, ts.naive_utc());
    }

    #[test]
    fn rejects_mismatched_group_id() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 30, 14, 30, 52).unwrap();
        let name = format_branch_name(DEFAULT_BRANCH_PREFIX, "core", ts, "abc123f");
        assert!(parse_branch_name(DEFAULT_BRANCH_PREFIX, "other-group", &name).is_none());
    }

    #[test]
    fn most_recent_picks_largest_timestamp() {
        let names = vec![
            "chore/sync-files-core-20250130-143052-abc123f",
            "chore/sync-files-core-20250201-090000-def4567",
            "not-a-sync-branch",
        ];
        let (name, parsed) = most_recent(DEFAULT_BRANCH_PREFIX, "core", names).unwrap();
        assert_eq!(name, "chore/sync-files-core-20250201-090000-def4567");
        assert_eq!(parsed.sha7, "def4567");
    }

    #[test]
    fn metadata_round_trips() {
        let meta = PrMetadata {
            group_id: "core".into(),
            group_name: "Core services".into(),
            source_repo: "org/source".into(),
            source_branch: "main".into(),
            source_commit: "abc123f0000000000000000000000000000000".into(),
            files: vec![FileMetadata {
                path: "a.yml".into(),
                kind: "added".into(),
            }],
            directories: vec![],
            performance: None,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 30, 14, 30, 52).unwrap(),
        };
        let body = format!("Some human text.\n\n{}\n", meta.to_block());
        let parsed = PrMetadata::from_body(&body).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn metadata_missing_from_unrelated_pr() {
        assert!(PrMetadata::from_body("just a normal PR body").is_none());
    }

    #[test]
    fn group_id_validation() {
        assert!(is_valid_group_id("core"));
        assert!(is_valid_group_id("core-services-2"));
        assert!(!is_valid_group_id("Core"));
        assert!(!is_valid_group_id("core_services"));
        assert!(!is_valid_group_id(""));
    }
}
