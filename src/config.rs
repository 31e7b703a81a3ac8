//! Config Loader & Validator (C0a). Deserializes the on-disk YAML into a
//! `Raw*` layer with `#[serde(deny_unknown_fields)]`, then validates and
//! lowers it into the `Config`/`Group`/`Target`/... layer that the rest of
//! the engine (C1-C11) actually sees. Nothing downstream of this module ever
//! looks at the raw layer.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::dag::{Dag, DagError, GraphNode};
use crate::error::{Result, SyncError};
use crate::transform::Transform;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawFileMapping {
    #[serde(default)]
    pub src: Option<String>,
    pub dest: String,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawDirectoryMapping {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_true")]
    pub preserve_structure: bool,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub delete: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawFileList {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub files: Vec<RawFileMapping>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawDirectoryList {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub directories: Vec<RawDirectoryMapping>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RawPrSets {
    #[serde(default)]
    pub pr_labels: Vec<String>,
    #[serde(default)]
    pub pr_assignees: Vec<String>,
    #[serde(default)]
    pub pr_reviewers: Vec<String>,
    #[serde(default)]
    pub pr_team_reviewers: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawSource {
    pub repo: String,
    pub branch: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawTarget {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files: Vec<RawFileMapping>,
    #[serde(default)]
    pub directories: Vec<RawDirectoryMapping>,
    #[serde(default)]
    pub file_list_refs: Vec<String>,
    #[serde(default)]
    pub directory_list_refs: Vec<String>,
    #[serde(default)]
    pub transform: Vec<Transform>,
    #[serde(default)]
    pub pr_labels: Vec<String>,
    #[serde(default)]
    pub pr_assignees: Vec<String>,
    #[serde(default)]
    pub pr_reviewers: Vec<String>,
    #[serde(default)]
    pub pr_team_reviewers: Vec<String>,
}

impl RawTarget {
    fn pr_sets(&self) -> RawPrSets {
        RawPrSets {
            pr_labels: self.pr_labels.clone(),
            pr_assignees: self.pr_assignees.clone(),
            pr_reviewers: self.pr_reviewers.clone(),
            pr_team_reviewers: self.pr_team_reviewers.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawGroup {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub source: RawSource,
    #[serde(default)]
    pub global: RawPrSets,
    #[serde(default)]
    pub defaults: RawPrSets,
    pub targets: Vec<RawTarget>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub version: u32,
    #[serde(default)]
    pub file_lists: Vec<RawFileList>,
    #[serde(default)]
    pub directory_lists: Vec<RawDirectoryList>,
    pub groups: Vec<RawGroup>,
}

// --- Validated layer -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub src: Option<String>,
    pub dest: String,
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMapping {
    pub src: String,
    pub dest: String,
    pub excludes: Vec<String>,
    pub preserve_structure: bool,
    pub include_hidden: bool,
    pub transforms: Vec<Transform>,
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrSets {
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub reviewers: Vec<String>,
    pub team_reviewers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub repo: String,
    pub branch: Option<String>,
    pub file_mappings: Vec<FileMapping>,
    pub directory_mappings: Vec<DirectoryMapping>,
    pub transforms: Vec<Transform>,
    /// Already merged per the §6 "global ∪ target, else defaults" rule.
    pub pr_sets: PrSets,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    pub enabled: bool,
    pub depends_on: Vec<String>,
    pub source: Source,
    pub targets: Vec<Target>,
}

impl GraphNode for Group {
    type NodeId = String;

    fn id(&self) -> impl Borrow<String> {
        &self.id
    }

    fn child_ids(&self) -> Vec<impl Borrow<String>> {
        self.depends_on.iter().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub groups: Dag<Group>,
}

// --- Loading & validation ---------------------------------------------------

pub fn parse(yaml: &str) -> Result<Config> {
    let raw: RawConfig = serde_yaml::from_str(yaml)?;
    validate(raw)
}

/// Reads and validates a config file from disk.
pub fn load(path: &Path) -> Result<Config> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        SyncError::ConfigInvalid(format!("reading {}: {e}", path.display()))
    })?;
    parse(&yaml)
}

fn merge_pr_sets(global: &RawPrSets, target: &RawPrSets, defaults: &RawPrSets) -> PrSets {
    fn merge_field(global: &[String], target: &[String], default: &[String]) -> Vec<String> {
        let union = dedup_preserve_order(global.iter().chain(target.iter()));
        if union.is_empty() {
            default.to_vec()
        } else {
            union
        }
    }
    PrSets {
        labels: merge_field(&global.pr_labels, &target.pr_labels, &defaults.pr_labels),
        assignees: merge_field(&global.pr_assignees, &target.pr_assignees, &defaults.pr_assignees),
        reviewers: merge_field(&global.pr_reviewers, &target.pr_reviewers, &defaults.pr_reviewers),
        team_reviewers: merge_field(
            &global.pr_team_reviewers,
            &target.pr_team_reviewers,
            &defaults.pr_team_reviewers,
        ),
    }
}

fn dedup_preserve_order<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item.clone());
        }
    }
    out
}

/// Rejects empty paths, absolute paths, and any component equal to `..`.
fn validate_path(field: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SyncError::InvalidInput(format!("{field} must not be empty")));
    }
    if path.starts_with('/') {
        return Err(SyncError::PathTraversal(format!(
            "{field} {path:?} must be a relative path"
        )));
    }
    if path.split('/').any(|component| component == "..") {
        return Err(SyncError::PathTraversal(format!(
            "{field} {path:?} contains a '..' component"
        )));
    }
    Ok(())
}

fn resolve_file_mappings(
    inline: &[RawFileMapping],
    refs: &[String],
    file_lists: &HashMap<String, &RawFileList>,
) -> Result<Vec<RawFileMapping>> {
    let mut out = Vec::new();
    for list_id in refs {
        let list = file_lists
            .get(list_id.as_str())
            .ok_or_else(|| SyncError::ConfigInvalid(format!("unknown file_list_ref {list_id:?}")))?;
        out.extend(list.files.iter().cloned());
    }
    out.extend(inline.iter().cloned());
    Ok(out)
}

fn resolve_directory_mappings(
    inline: &[RawDirectoryMapping],
    refs: &[String],
    directory_lists: &HashMap<String, &RawDirectoryList>,
) -> Result<Vec<RawDirectoryMapping>> {
    let mut out = Vec::new();
    for list_id in refs {
        let list = directory_lists.get(list_id.as_str()).ok_or_else(|| {
            SyncError::ConfigInvalid(format!("unknown directory_list_ref {list_id:?}"))
        })?;
        out.extend(list.directories.iter().cloned());
    }
    out.extend(inline.iter().cloned());
    Ok(out)
}

fn validate_target(raw: &RawTarget, group: &RawGroup, file_lists: &HashMap<String, &RawFileList>, directory_lists: &HashMap<String, &RawDirectoryList>) -> Result<Target> {
    let raw_files = resolve_file_mappings(&raw.files, &raw.file_list_refs, file_lists)?;
    let raw_dirs = resolve_directory_mappings(&raw.directories, &raw.directory_list_refs, directory_lists)?;

    let mut dests = HashSet::new();
    let mut file_mappings = Vec::with_capacity(raw_files.len());
    for fm in &raw_files {
        if !fm.delete {
            let src = fm.src.as_deref().ok_or_else(|| {
                SyncError::ConfigInvalid(format!("file mapping for {:?} needs src unless delete=true", fm.dest))
            })?;
            validate_path("file mapping src", src)?;
        }
        validate_path("file mapping dest", &fm.dest)?;
        if !dests.insert(fm.dest.clone()) {
            return Err(SyncError::ConfigInvalid(format!(
                "duplicate dest {:?} in target {:?}",
                fm.dest, raw.repo
            )));
        }
        file_mappings.push(FileMapping {
            src: fm.src.clone(),
            dest: fm.dest.clone(),
            delete: fm.delete,
        });
    }

    let mut directory_mappings = Vec::with_capacity(raw_dirs.len());
    for dm in &raw_dirs {
        validate_path("directory mapping src", &dm.src)?;
        validate_path("directory mapping dest", &dm.dest)?;
        if !dests.insert(dm.dest.clone()) {
            return Err(SyncError::ConfigInvalid(format!(
                "duplicate dest {:?} in target {:?}",
                dm.dest, raw.repo
            )));
        }
        directory_mappings.push(DirectoryMapping {
            src: dm.src.clone(),
            dest: dm.dest.clone(),
            excludes: dm.excludes.clone(),
            preserve_structure: dm.preserve_structure,
            include_hidden: dm.include_hidden,
            transforms: dm.transforms.clone(),
            delete: dm.delete,
        });
    }

    Ok(Target {
        repo: raw.repo.clone(),
        branch: raw.branch.clone(),
        file_mappings,
        directory_mappings,
        transforms: raw.transform.clone(),
        pr_sets: merge_pr_sets(&group.global, &raw.pr_sets(), &group.defaults),
    })
}

pub fn validate(raw: RawConfig) -> Result<Config> {
    if raw.version != 1 {
        return Err(SyncError::ConfigInvalid(format!(
            "unsupported config version {}",
            raw.version
        )));
    }
    if raw.groups.is_empty() {
        return Err(SyncError::ConfigInvalid("at least one group is required".into()));
    }

    let mut file_lists = HashMap::new();
    for list in &raw.file_lists {
        if file_lists.insert(list.id.as_str(), list).is_some() {
            return Err(SyncError::ConfigInvalid(format!("duplicate file_list id {:?}", list.id)));
        }
    }
    let mut directory_lists = HashMap::new();
    for list in &raw.directory_lists {
        if directory_lists.insert(list.id.as_str(), list).is_some() {
            return Err(SyncError::ConfigInvalid(format!(
                "duplicate directory_list id {:?}",
                list.id
            )));
        }
    }

    let mut seen_ids = HashSet::new();
    let mut groups = Vec::with_capacity(raw.groups.len());
    for raw_group in &raw.groups {
        if !crate::naming::is_valid_group_id(&raw_group.id) {
            return Err(SyncError::ConfigInvalid(format!(
                "group id {:?} must be lowercase alphanumeric with hyphens",
                raw_group.id
            )));
        }
        if !seen_ids.insert(raw_group.id.clone()) {
            return Err(SyncError::ConfigInvalid(format!("duplicate group id {:?}", raw_group.id)));
        }
        if raw_group.targets.is_empty() {
            return Err(SyncError::ConfigInvalid(format!(
                "group {:?} has no targets",
                raw_group.id
            )));
        }

        let mut targets = Vec::with_capacity(raw_group.targets.len());
        for raw_target in &raw_group.targets {
            targets.push(validate_target(raw_target, raw_group, &file_lists, &directory_lists)?);
        }

        groups.push(Group {
            id: raw_group.id.clone(),
            name: raw_group.name.clone(),
            description: raw_group.description.clone(),
            priority: raw_group.priority,
            enabled: raw_group.enabled,
            depends_on: raw_group.depends_on.clone(),
            source: Source {
                repo: raw_group.source.repo.clone(),
                branch: raw_group.source.branch.clone(),
            },
            targets,
        });
    }

    for group in &groups {
        for dep in &group.depends_on {
            if !seen_ids.contains(dep) {
                return Err(SyncError::ConfigInvalid(format!(
                    "group {:?} depends_on unknown group {:?}",
                    group.id, dep
                )));
            }
        }
    }

    let groups = Dag::new(groups).map_err(|e| match e {
        DagError::Cycle(id) => {
            SyncError::ConfigInvalid(format!("dependency cycle detected involving group {id:?}"))
        }
        other => SyncError::ConfigInvalid(other.to_string()),
    })?;

    Ok(Config { groups })
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;

    fn minimal_yaml() -> String {
        r#"
version: 1
groups:
  - name: Core
    id: core
    priority: 0
    source:
      repo: org/source
      branch: main
    targets:
      - repo: org/target
        files:
          - src: a.yml
            dest: a.yml
"#
        .to_string()
    }

    #[test]
    fn parses_minimal_config() {
        let config = parse(&minimal_yaml()).unwrap();
        assert_eq!(config.groups.len(), 1);
        let group = config.groups.node(&"core".to_string()).unwrap();
        assert_eq!(group.targets.len(), 1);
        assert_eq!(group.targets[0].file_mappings.len(), 1);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let yaml = format!("{}\nbogus: true", minimal_yaml());
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn rejects_duplicate_group_id() {
        let yaml = r#"
version: 1
groups:
  - name: A
    id: core
    priority: 0
    source: {repo: org/source, branch: main}
    targets: [{repo: org/target, files: [{src: a.yml, dest: a.yml}]}]
  - name: B
    id: core
    priority: 1
    source: {repo: org/source, branch: main}
    targets: [{repo: org/target2, files: [{src: b.yml, dest: b.yml}]}]
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let yaml = r#"
version: 1
groups:
  - name: A
    id: a
    priority: 0
    depends_on: [b]
    source: {repo: org/source, branch: main}
    targets: [{repo: org/target, files: [{src: a.yml, dest: a.yml}]}]
  - name: B
    id: b
    priority: 0
    depends_on: [a]
    source: {repo: org/source, branch: main}
    targets: [{repo: org/target, files: [{src: b.yml, dest: b.yml}]}]
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_path_traversal_in_dest() {
        let yaml = r#"
version: 1
groups:
  - name: A
    id: a
    priority: 0
    source: {repo: org/source, branch: main}
    targets: [{repo: org/target, files: [{src: a.yml, dest: "../escape.yml"}]}]
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SyncError::PathTraversal(_)));
    }

    #[test]
    fn rejects_duplicate_dest_within_target() {
        let yaml = r#"
version: 1
groups:
  - name: A
    id: a
    priority: 0
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/target
        files:
          - {src: a.yml, dest: out.yml}
          - {src: b.yml, dest: out.yml}
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[googletest::test]
    fn merges_global_and_target_pr_sets() {
        let yaml = r#"
version: 1
groups:
  - name: A
    id: a
    priority: 0
    source: {repo: org/source, branch: main}
    global:
      pr_labels: [sync]
    defaults:
      pr_reviewers: [fallback-team]
    targets:
      - repo: org/target
        files: [{src: a.yml, dest: a.yml}]
        pr_labels: [extra]
"#;
        let config = parse(yaml).unwrap();
        let group = config.groups.node(&"a".to_string()).unwrap();
        let target = &group.targets[0];
        expect_that!(target.pr_sets.labels, unordered_elements_are![eq("sync"), eq("extra")]);
        expect_that!(target.pr_sets.reviewers, elements_are![eq("fallback-team")]);
    }

    #[test]
    fn expands_file_list_refs() {
        let yaml = r#"
version: 1
file_lists:
  - id: common
    files:
      - {src: common.yml, dest: common.yml}
groups:
  - name: A
    id: a
    priority: 0
    source: {repo: org/source, branch: main}
    targets:
      - repo: org/target
        file_list_refs: [common]
"#;
        let config = parse(yaml).unwrap();
        let group = config.groups.node(&"a".to_string()).unwrap();
        assert_eq!(group.targets[0].file_mappings.len(), 1);
        assert_eq!(group.targets[0].file_mappings[0].dest, "common.yml");
    }
}
