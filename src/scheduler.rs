//! Group Scheduler (C9): turns a validated [`Config`] into an ordered plan of
//! dependency layers, each containing the groups that are eligible to run
//! concurrently, sorted deterministically within the layer.

use crate::config::{Config, Group, Target};

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub only: Vec<String>,
    pub skip: Vec<String>,
}

impl GroupFilter {
    fn matches(&self, group: &Group) -> bool {
        let selector_matches = |s: &str| s == group.id || s == group.name;
        if !self.only.is_empty() && !self.only.iter().any(|s| selector_matches(s)) {
            return false;
        }
        if self.skip.iter().any(|s| selector_matches(s)) {
            return false;
        }
        true
    }
}

/// Builds the execution plan: groups filtered by `enabled`/selectors,
/// partitioned into dependency layers, each layer sorted by `(priority, id)`.
///
/// Layering runs first over the full, unfiltered DAG, and `enabled`/selector
/// filtering is applied within each resulting layer afterward. The two
/// never conflict because filtering only ever removes groups, never
/// reorders them: a filtered-out group's dependents still land in whatever
/// later layer the unfiltered DAG put them in, so they simply see it absent
/// from their layer's contents - only the skipped group itself is skipped,
/// matching the fact that dependency ordering is a *sequencing* concern,
/// not a hard requirement that prerequisites ran.
pub fn plan<'a>(config: &'a Config, filter: &GroupFilter) -> Vec<Vec<&'a Group>> {
    config
        .groups
        .layers()
        .into_iter()
        .map(|layer| {
            let mut eligible: Vec<&Group> = layer
                .into_iter()
                .filter(|g| g.enabled && filter.matches(g))
                .collect();
            eligible.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
            eligible
        })
        .filter(|layer| !layer.is_empty())
        .collect()
}

/// Narrows a group's targets to the given repos. Empty `repos` means no
/// narrowing - every target in the group is kept, matching the CLI's
/// "empty means every target in every selected group" contract.
pub fn filter_targets<'a>(targets: &'a [Target], repos: &[String]) -> Vec<&'a Target> {
    if repos.is_empty() {
        return targets.iter().collect();
    }
    targets.iter().filter(|t| repos.iter().any(|r| r == &t.repo)).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::parse;

    fn config_with_groups() -> Config {
        parse(
            r#"
version: 1
groups:
  - name: Beta
    id: beta
    priority: 5
    source: {repo: org/source, branch: main}
    targets: [{repo: org/t1, files: [{src: a.yml, dest: a.yml}]}]
  - name: Alpha
    id: alpha
    priority: 5
    source: {repo: org/source, branch: main}
    targets: [{repo: org/t2, files: [{src: a.yml, dest: a.yml}]}]
  - name: Dependent
    id: dependent
    priority: 0
    depends_on: [alpha, beta]
    source: {repo: org/source, branch: main}
    targets: [{repo: org/t3, files: [{src: a.yml, dest: a.yml}]}]
  - name: Disabled
    id: disabled
    priority: 0
    enabled: false
    source: {repo: org/source, branch: main}
    targets: [{repo: org/t4, files: [{src: a.yml, dest: a.yml}]}]
"#,
        )
        .unwrap()
    }

    #[test]
    fn layers_respect_dependencies_and_tie_break_by_id() {
        let config = config_with_groups();
        let plan = plan(&config, &GroupFilter::default());
        assert_eq!(plan.len(), 2);
        let first_layer: Vec<&str> = plan[0].iter().map(|g| g.id.as_str()).collect();
        assert_eq!(first_layer, vec!["alpha", "beta"]);
        let second_layer: Vec<&str> = plan[1].iter().map(|g| g.id.as_str()).collect();
        assert_eq!(second_layer, vec!["dependent"]);
    }

    #[test]
    fn disabled_groups_are_excluded() {
        let config = config_with_groups();
        let plan = plan(&config, &GroupFilter::default());
        let all_ids: Vec<&str> = plan.iter().flatten().map(|g| g.id.as_str()).collect();
        assert!(!all_ids.contains(&"disabled"));
    }

    #[test]
    fn only_filter_restricts_to_named_groups() {
        let config = config_with_groups();
        let filter = GroupFilter {
            only: vec!["alpha".to_string()],
            skip: vec![],
        };
        let plan = plan(&config, &filter);
        let all_ids: Vec<&str> = plan.iter().flatten().map(|g| g.id.as_str()).collect();
        assert_eq!(all_ids, vec!["alpha"]);
    }

    #[test]
    fn skip_filter_removes_named_groups() {
        let config = config_with_groups();
        let filter = GroupFilter {
            only: vec![],
            skip: vec!["beta".to_string()],
        };
        let plan = plan(&config, &filter);
        let all_ids: Vec<&str> = plan.iter().flatten().map(|g| g.id.as_str()).collect();
        assert!(!all_ids.contains(&"beta"));
        assert!(all_ids.contains(&"alpha"));
    }

    #[test]
    fn filter_targets_empty_repos_keeps_everything() {
        let config = config_with_groups();
        let group = &config.groups[0];
        let kept = filter_targets(&group.targets, &[]);
        assert_eq!(kept.len(), group.targets.len());
    }

    #[test]
    fn filter_targets_narrows_to_named_repos() {
        let config = config_with_groups();
        let group = config.groups.iter().find(|g| g.id == "alpha").unwrap();
        let kept = filter_targets(&group.targets, &["org/t2".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].repo, "org/t2");

        let kept = filter_targets(&group.targets, &["org/nonexistent".to_string()]);
        assert!(kept.is_empty());
    }
}
