use serde::{Deserialize, Serialize};

/// Glob-based tool policy for an agent or the whole gateway.
///
/// Patterns support a trailing `*` wildcard (`"*"`, `"fs_*"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolPolicy {
    /// Tools the agent may use. Empty means every registered tool.
    pub enabled: Vec<String>,
    /// Tools the agent may never use. Wins over `enabled`.
    pub disabled: Vec<String>,
    /// Tools that only run after an operator approves the call.
    pub require_approval: Vec<String>,
}

/// Check if a tool name matches a glob pattern (supports trailing `*`).
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

fn any_match(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, name))
}

impl ToolPolicy {
    pub fn is_enabled(&self, tool_name: &str) -> bool {
        if any_match(&self.disabled, tool_name) {
            return false;
        }
        self.enabled.is_empty() || any_match(&self.enabled, tool_name)
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        any_match(&self.require_approval, tool_name)
    }

    /// Layer `other` (higher precedence) on top of `self`.
    ///
    /// A non-empty `enabled` list in `other` replaces ours; `disabled` and
    /// `require_approval` accumulate so an agent can tighten but never
    /// loosen the gateway policy.
    pub fn merge_with(&self, other: &ToolPolicy) -> ToolPolicy {
        let accumulate = |a: &[String], b: &[String]| {
            let mut combined = a.to_vec();
            combined.extend(b.iter().filter(|p| !a.contains(p)).cloned());
            combined
        };
        ToolPolicy {
            enabled: if other.enabled.is_empty() {
                self.enabled.clone()
            } else {
                other.enabled.clone()
            },
            disabled: accumulate(&self.disabled, &other.disabled),
            require_approval: accumulate(&self.require_approval, &other.require_approval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: &[&str], disabled: &[&str], approval: &[&str]) -> ToolPolicy {
        let v = |s: &[&str]| s.iter().map(|s| s.to_string()).collect();
        ToolPolicy {
            enabled: v(enabled),
            disabled: v(disabled),
            require_approval: v(approval),
        }
    }

    #[test]
    fn empty_policy_enables_everything() {
        let p = ToolPolicy::default();
        assert!(p.is_enabled("exec"));
        assert!(!p.requires_approval("exec"));
    }

    #[test]
    fn disabled_wins_over_enabled() {
        let p = policy(&["*"], &["exec"], &[]);
        assert!(!p.is_enabled("exec"));
        assert!(p.is_enabled("current_time"));
    }

    #[test]
    fn enabled_list_restricts() {
        let p = policy(&["fs_*"], &[], &[]);
        assert!(p.is_enabled("fs_read"));
        assert!(!p.is_enabled("exec"));
    }

    #[test]
    fn approval_glob() {
        let p = policy(&[], &[], &["shell_*"]);
        assert!(p.requires_approval("shell_run"));
        assert!(!p.requires_approval("current_time"));
    }

    #[test]
    fn merge_accumulates_restrictions() {
        let global = policy(&[], &["browser"], &["exec"]);
        let agent = policy(&["exec", "current_time"], &["exec"], &["current_time"]);
        let merged = global.merge_with(&agent);
        assert_eq!(merged.enabled, vec!["exec", "current_time"]);
        assert!(!merged.is_enabled("browser"));
        assert!(!merged.is_enabled("exec"));
        assert!(merged.requires_approval("exec"));
        assert!(merged.requires_approval("current_time"));
    }
}
