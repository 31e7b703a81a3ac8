//! Glob-based exclusion filtering for directory mappings, with
//! always-applied defaults layered under whatever the user configures.

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Defaults applied to every directory mapping regardless of user config,
/// unless the mapping is a `delete=true` mapping (which doesn't sync content
/// at all, so exclusions are moot).
pub const DEFAULT_EXCLUDES: &[&str] = &["*.out", "*.test", "*.exe", "**/.DS_Store", "**/tmp/*", "**/.git"];

pub struct ExclusionMatcher {
    set: GlobSet,
    include_hidden: bool,
}

impl ExclusionMatcher {
    /// Builds a matcher from the user's declared patterns plus the always-on
    /// defaults. `include_hidden=false` additionally suppresses any path with
    /// a dotfile-style component, except `.github` when the mapping's `dest`
    /// targets it explicitly (the caller is expected to pass that mapping's
    /// own `dest` prefix check separately; this matcher only applies the glob
    /// patterns and the generic hidden-file rule).
    pub fn new(user_patterns: &[String], include_hidden: bool) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES.iter().chain(user_patterns.iter().map(|s| s.as_str())) {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
            include_hidden,
        })
    }

    /// Whether `path` should be excluded from sync.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.set.is_match(path) {
            return true;
        }
        if !self.include_hidden && is_hidden(path) {
            return true;
        }
        false
    }

    /// Filters a candidate path list down to the ones that should actually be
    /// synced.
    pub fn filter<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        paths.into_iter().filter(|p| !self.is_excluded(p)).collect()
    }
}

fn is_hidden(path: &str) -> bool {
    path.split('/').any(|component| {
        component.starts_with('.') && component != "." && component != ".." && component != ".github"
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_excludes_apply_with_no_user_patterns() {
        let m = ExclusionMatcher::new(&[], true).unwrap();
        assert!(m.is_excluded("build.out"));
        assert!(m.is_excluded("src/.git/HEAD"));
        assert!(m.is_excluded("a/tmp/b"));
        assert!(!m.is_excluded("src/main.rs"));
    }

    #[test]
    fn user_patterns_are_additive() {
        let m = ExclusionMatcher::new(&["*.generated.go".to_string()], true).unwrap();
        assert!(m.is_excluded("pb.generated.go"));
        assert!(m.is_excluded("build.out")); // default still applies
    }

    #[test]
    fn hidden_files_included_by_default() {
        let m = ExclusionMatcher::new(&[], true).unwrap();
        assert!(!m.is_excluded(".env"));
    }

    #[test]
    fn hidden_files_suppressed_when_requested() {
        let m = ExclusionMatcher::new(&[], false).unwrap();
        assert!(m.is_excluded(".env"));
        assert!(m.is_excluded("nested/.secret"));
    }

    #[test]
    fn dot_github_is_never_treated_as_hidden() {
        let m = ExclusionMatcher::new(&[], false).unwrap();
        assert!(!m.is_excluded(".github/workflows/ci.yml"));
    }

    #[test]
    fn filter_keeps_only_non_excluded() {
        let m = ExclusionMatcher::new(&[], true).unwrap();
        let paths = vec!["a.rs", "b.out", "c.rs"];
        assert_eq!(m.filter(paths), vec!["a.rs", "c.rs"]);
    }
}
