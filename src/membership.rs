//! # Membership Resolver
//!
//! Pure computation of effective group membership. Direct memberships
//! live on entities; INCLUDE and EXCLUDE rules live on groups. Resolution
//! walks the rule graph depth-first from each direct group:
//!
//! - entering a group adds it to the effective set;
//! - an INCLUDE rule recurses into its target;
//! - an EXCLUDE rule is applied after the owning group's recursion
//!   finishes: the target's own closure is computed and subtracted.
//!
//! A group already on the traversal stack is skipped, so rule cycles
//! terminate. Targets that no longer exist are skipped silently; a rule
//! may dangle after its group is deleted and resolution must not fail
//! over it. Output is sorted and deduplicated, so the resolver is
//! deterministic for a fixed tree state.

use crate::group::{ExpansionMode, Group};
use std::collections::{BTreeSet, HashMap};

/// Expand `direct` group names through the expansion graph in `groups`.
///
/// Returns the effective membership set, sorted lexicographically.
pub fn effective_memberships(groups: &HashMap<String, Group>, direct: &[String]) -> Vec<String> {
    let mut effective: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = Vec::new();
    for name in direct {
        walk(groups, name, &mut effective, &mut stack);
    }
    effective.into_iter().collect()
}

/// Direct memberships only: sorted and deduplicated, no expansion.
pub fn direct_memberships(direct: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = direct.iter().cloned().collect();
    set.into_iter().collect()
}

fn walk(
    groups: &HashMap<String, Group>,
    name: &str,
    effective: &mut BTreeSet<String>,
    stack: &mut Vec<String>,
) {
    if stack.iter().any(|g| g == name) {
        return;
    }
    let group = match groups.get(name) {
        Some(g) => g,
        None => return,
    };

    effective.insert(name.to_string());
    stack.push(name.to_string());

    for rule in &group.expansions {
        if rule.mode == ExpansionMode::Include {
            walk(groups, &rule.target, effective, stack);
        }
    }

    stack.pop();

    // Exclusions are applied once this group's own subtree is fully
    // expanded, so INCLUDE X + EXCLUDE X nets out to "without X"
    // regardless of rule order.
    for rule in &group.expansions {
        if rule.mode == ExpansionMode::Exclude {
            let mut excluded = BTreeSet::new();
            let mut substack = Vec::new();
            walk(groups, &rule.target, &mut excluded, &mut substack);
            for g in excluded {
                effective.remove(&g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Expansion;

    fn graph(edges: &[(&str, ExpansionMode, &str)], names: &[&str]) -> HashMap<String, Group> {
        let mut groups = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            groups.insert(name.to_string(), Group::new(*name, "", i as i32 + 1));
        }
        for (parent, mode, child) in edges {
            groups
                .get_mut(*parent)
                .unwrap()
                .expansions
                .push(Expansion {
                    mode: *mode,
                    target: child.to_string(),
                });
        }
        groups
    }

    fn resolve(groups: &HashMap<String, Group>, direct: &[&str]) -> Vec<String> {
        let direct: Vec<String> = direct.iter().map(|s| s.to_string()).collect();
        effective_memberships(groups, &direct)
    }

    #[test]
    fn test_no_rules_returns_direct() {
        let groups = graph(&[], &["a", "b"]);
        assert_eq!(resolve(&groups, &["b", "a", "a"]), vec!["a", "b"]);
    }

    #[test]
    fn test_include_chain() {
        let groups = graph(
            &[
                ("a", ExpansionMode::Include, "b"),
                ("b", ExpansionMode::Include, "c"),
            ],
            &["a", "b", "c"],
        );
        assert_eq!(resolve(&groups, &["a"]), vec!["a", "b", "c"]);
        assert_eq!(resolve(&groups, &["b"]), vec!["b", "c"]);
    }

    #[test]
    fn test_exclude_removes_computed_closure() {
        let groups = graph(
            &[
                ("a", ExpansionMode::Include, "b"),
                ("b", ExpansionMode::Include, "c"),
                ("a", ExpansionMode::Exclude, "c"),
            ],
            &["a", "b", "c"],
        );
        assert_eq!(resolve(&groups, &["a"]), vec!["a", "b"]);
    }

    #[test]
    fn test_include_then_exclude_same_target() {
        // Order independence: the exclusion wins whichever side of the
        // include it sits on.
        for rules in [
            vec![
                ("a", ExpansionMode::Include, "b"),
                ("a", ExpansionMode::Exclude, "b"),
            ],
            vec![
                ("a", ExpansionMode::Exclude, "b"),
                ("a", ExpansionMode::Include, "b"),
            ],
        ] {
            let groups = graph(&rules, &["a", "b"]);
            assert_eq!(resolve(&groups, &["a"]), vec!["a"]);
        }
    }

    #[test]
    fn test_exclude_subtree() {
        let groups = graph(
            &[
                ("a", ExpansionMode::Include, "b"),
                ("a", ExpansionMode::Exclude, "c"),
                ("c", ExpansionMode::Include, "b"),
            ],
            &["a", "b", "c"],
        );
        // Excluding c removes c's whole closure, b included.
        assert_eq!(resolve(&groups, &["a"]), vec!["a"]);
    }

    #[test]
    fn test_cycle_terminates() {
        let groups = graph(
            &[
                ("a", ExpansionMode::Include, "b"),
                ("b", ExpansionMode::Include, "a"),
            ],
            &["a", "b"],
        );
        assert_eq!(resolve(&groups, &["a"]), vec!["a", "b"]);
        assert_eq!(resolve(&groups, &["b"]), vec!["a", "b"]);
    }

    #[test]
    fn test_self_cycle_terminates() {
        let groups = graph(&[("a", ExpansionMode::Include, "a")], &["a"]);
        assert_eq!(resolve(&groups, &["a"]), vec!["a"]);
    }

    #[test]
    fn test_dangling_targets_skipped() {
        let groups = graph(&[("a", ExpansionMode::Include, "ghost")], &["a"]);
        assert_eq!(resolve(&groups, &["a"]), vec!["a"]);
        // A dangling direct membership is skipped too.
        assert_eq!(resolve(&groups, &["a", "ghost"]), vec!["a"]);
        // As is a dangling exclusion.
        let groups = graph(&[("a", ExpansionMode::Exclude, "ghost")], &["a"]);
        assert_eq!(resolve(&groups, &["a"]), vec!["a"]);
    }

    #[test]
    fn test_deterministic() {
        let groups = graph(
            &[
                ("a", ExpansionMode::Include, "b"),
                ("b", ExpansionMode::Include, "c"),
                ("a", ExpansionMode::Exclude, "d"),
                ("d", ExpansionMode::Include, "c"),
            ],
            &["a", "b", "c", "d"],
        );
        let first = resolve(&groups, &["a"]);
        for _ in 0..10 {
            assert_eq!(resolve(&groups, &["a"]), first);
        }
    }

    #[test]
    fn test_direct_memberships_sorted_deduped() {
        let direct = vec!["z".to_string(), "a".to_string(), "z".to_string()];
        assert_eq!(direct_memberships(&direct), vec!["a", "z"]);
    }
}
