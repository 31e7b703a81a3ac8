//! Deterministic, composable byte transforms applied to source file content
//! before it's compared against the target. Transforms never see target
//! bytes and are only ever applied to non-binary source files (see
//! [`crate::diff`] for the binary/text split).

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    // Matches both {{VAR}} and ${VAR}. Capture group 2 is the variable name
    // regardless of which delimiter matched.
    static ref VAR_RE: Regex = Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}|\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Substitutes `{{VAR}}` and `${VAR}` occurrences using `vars`. Unknown
/// variables are left verbatim. Single-pass: replacement text is copied
/// through untouched, never re-scanned for further delimiters, so a
/// substituted value containing `{{...}}` can't trigger a second substitution
/// or an infinite loop.
pub fn substitute_variables(input: &[u8], vars: &HashMap<String, String>) -> Vec<u8> {
    // The built-in transforms only operate on text; binary detection upstream
    // (C4) guarantees we never get here with binary content.
    let text = match std::str::from_utf8(input) {
        Ok(t) => t,
        Err(_) => return input.to_vec(),
    };

    let mut out = String::with_capacity(text.len());
    let mut last_end = 0;
    for caps in VAR_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        out.push_str(&text[last_end..whole.start()]);
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .expect("one alternative always matches")
            .as_str();
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(whole.as_str()),
        }
        last_end = whole.end();
    }
    out.push_str(&text[last_end..]);
    out.into_bytes()
}

/// Rewrites textual occurrences of the source repository's canonical name to
/// the target repository's. Applied after variable substitution, per §4.3.
/// A plain literal replacement: repository names aren't regex metacharacters
/// in any scheme this tool expects to see, and treating them as a regex would
/// risk surprising escapes for names containing `.` or `+`.
pub fn rewrite_repo_identity(input: &[u8], source_repo: &str, target_repo: &str) -> Vec<u8> {
    if source_repo == target_repo {
        return input.to_vec();
    }
    let text = match std::str::from_utf8(input) {
        Ok(t) => t,
        Err(_) => return input.to_vec(),
    };
    text.replace(source_repo, target_repo).into_bytes()
}

/// One configured transform step, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    VariableSubstitution,
    RepoIdentityRewrite,
}

/// Context needed to actually run the configured transforms against one file.
pub struct TransformContext<'a> {
    pub variables: &'a HashMap<String, String>,
    pub source_repo: &'a str,
    pub target_repo: &'a str,
}

/// Applies `transforms` in order to `bytes`, which must already be known to
/// be non-binary (callers run binary detection first).
pub fn apply(transforms: &[Transform], bytes: &[u8], ctx: &TransformContext) -> Vec<u8> {
    let mut current = bytes.to_vec();
    for transform in transforms {
        current = match transform {
            Transform::VariableSubstitution => substitute_variables(&current, ctx.variables),
            Transform::RepoIdentityRewrite => {
                rewrite_repo_identity(&current, ctx.source_repo, ctx.target_repo)
            }
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_both_delimiter_styles() {
        let vars = vars(&[("NAME", "my-svc")]);
        assert_eq!(
            substitute_variables(b"SERVICE={{NAME}}", &vars),
            b"SERVICE=my-svc"
        );
        assert_eq!(
            substitute_variables(b"SERVICE=${NAME}", &vars),
            b"SERVICE=my-svc"
        );
    }

    #[test]
    fn unknown_variables_left_verbatim() {
        let vars = vars(&[]);
        assert_eq!(
            substitute_variables(b"hello {{UNKNOWN}}", &vars),
            b"hello {{UNKNOWN}}"
        );
    }

    #[test]
    fn substitution_is_single_pass() {
        // If the replacement value itself looked like a delimiter and we
        // re-scanned, this would substitute twice. It must not.
        let vars = vars(&[("A", "{{B}}"), ("B", "leaked")]);
        assert_eq!(substitute_variables(b"{{A}}", &vars), b"{{B}}");
    }

    #[test]
    fn repo_identity_rewrite() {
        let out = rewrite_repo_identity(b"see org/source for details", "org/source", "org/target");
        assert_eq!(out, b"see org/target for details");
    }

    #[test]
    fn repo_identity_rewrite_noop_when_repos_match() {
        let out = rewrite_repo_identity(b"org/source", "org/source", "org/source");
        assert_eq!(out, b"org/source");
    }

    #[test]
    fn apply_runs_transforms_in_order() {
        let vars = vars(&[("NAME", "org/source")]);
        let ctx = TransformContext {
            variables: &vars,
            source_repo: "org/source",
            target_repo: "org/target",
        };
        let transforms = vec![Transform::VariableSubstitution, Transform::RepoIdentityRewrite];
        let out = apply(&transforms, b"service: {{NAME}}", &ctx);
        assert_eq!(out, b"service: org/target");
    }

    #[test]
    fn transforms_are_idempotent_on_their_own_output() {
        let vars = vars(&[("NAME", "my-svc")]);
        let once = substitute_variables(b"SERVICE={{NAME}}", &vars);
        let twice = substitute_variables(&once, &vars);
        assert_eq!(once, twice);
    }
}
