use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Wildcard pattern matching (simple glob: `*` matches any char sequence)
// ---------------------------------------------------------------------------

/// Match a name against a pattern that may contain `*` wildcards.
/// Examples: `patch.*` matches `patch.apply_prod`,
///           `*.apply_*` matches `image.apply_nonprod`.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut remaining = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !remaining.starts_with(part) {
                return false;
            }
            remaining = &remaining[part.len()..];
        } else if i == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Check if any pattern in the list matches the given name.
pub fn any_pattern_matches<S: AsRef<str>>(patterns: &[S], name: &str) -> bool {
    patterns
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .any(|p| matches_wildcard(p, name))
}

// ---------------------------------------------------------------------------
// Expand allow/deny patterns against a closed catalog
// ---------------------------------------------------------------------------

/// Retain catalog names matching at least one allow pattern. Deny patterns
/// are applied after allow and take precedence: a name matching both is
/// denied. An empty allow list selects nothing, so agents never inherit the
/// whole catalog by omission.
pub fn expand_patterns<'a>(
    catalog: impl IntoIterator<Item = &'a str>,
    allow_patterns: &[&str],
    deny_patterns: &[&str],
) -> BTreeSet<String> {
    catalog
        .into_iter()
        .filter(|name| {
            let allowed = any_pattern_matches(allow_patterns, name);
            let denied = any_pattern_matches(deny_patterns, name);
            if allowed && denied {
                tracing::debug!(tool = *name, "capability excluded by deny pattern");
            }
            allowed && !denied
        })
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_prefix_suffix_and_infix() {
        assert!(matches_wildcard("patch.*", "patch.apply_prod"));
        assert!(matches_wildcard("*.apply_prod", "patch.apply_prod"));
        assert!(matches_wildcard("*apply*", "image.apply_nonprod"));
        assert!(matches_wildcard("*", "anything"));
        assert!(!matches_wildcard("patch.*", "drift.detect"));
        assert!(!matches_wildcard("patch.apply", "patch.apply_prod"));
    }

    #[test]
    fn deny_patterns_take_precedence_over_allow() {
        let catalog = ["patch.assess", "patch.apply_prod", "patch.apply_nonprod"];
        let expanded = expand_patterns(catalog, &["patch.*"], &["*_prod"]);
        assert!(expanded.contains("patch.assess"));
        assert!(expanded.contains("patch.apply_nonprod"));
        assert!(!expanded.contains("patch.apply_prod"));
    }

    #[test]
    fn empty_allow_list_selects_nothing() {
        let expanded = expand_patterns(["drift.detect"], &[], &[]);
        assert!(expanded.is_empty());
    }

    #[test]
    fn blank_patterns_are_ignored() {
        assert!(!any_pattern_matches(&["  ", ""], "drift.detect"));
        assert!(any_pattern_matches(&["", "drift.*"], "drift.detect"));
    }
}
