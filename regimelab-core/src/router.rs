//! Strategy routing: stabilized regime set → at most one strategy set.
//!
//! A miss is normal and returns `None`; there is simply no entry strategy on
//! that bar.

use crate::config::{CompiledRule, CompiledStrategySet, RegimeMatch};
use crate::regime::ActiveRegimeSet;

/// The winning rule and its target set.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Position in the priority-ordered rule list.
    pub rule_index: usize,
    pub rule: &'a CompiledRule,
    pub set: &'a CompiledStrategySet,
}

impl RegimeMatch {
    /// `all_of` ⊆ active, `any_of` ∩ active ≠ ∅, `none_of` ∩ active = ∅.
    /// Empty clauses are ignored.
    pub fn matches(&self, active: &ActiveRegimeSet) -> bool {
        let all = self.all_of.iter().all(|id| active.contains(id));
        let any = self.any_of.is_empty() || self.any_of.iter().any(|id| active.contains(id));
        let none = !self.none_of.iter().any(|id| active.contains(id));
        all && any && none
    }
}

/// First matching rule in priority order. `rules` must already be sorted
/// (as [`crate::config::CompiledConfig::rules`] is).
pub fn route<'a>(
    active: &ActiveRegimeSet,
    rules: &'a [CompiledRule],
    sets: &'a [CompiledStrategySet],
) -> Option<Route<'a>> {
    rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.matcher.matches(active))
        .and_then(|(rule_index, rule)| {
            sets.get(rule.target).map(|set| Route {
                rule_index,
                rule,
                set,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(ids: &[&str]) -> ActiveRegimeSet {
        ActiveRegimeSet::from_ordered(ids.iter().map(|s| s.to_string()).collect())
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn rule(matcher: RegimeMatch, target: usize, priority: i32) -> CompiledRule {
        CompiledRule {
            matcher,
            target,
            priority,
            exit_on_unmatch: true,
            declared_at: target,
        }
    }

    fn sets(n: usize) -> Vec<CompiledStrategySet> {
        (0..n)
            .map(|i| CompiledStrategySet {
                id: format!("set{i}"),
                strategies: vec![],
            })
            .collect()
    }

    #[test]
    fn higher_priority_all_of_beats_lower_any_of() {
        let rules = vec![
            rule(
                RegimeMatch {
                    all_of: ids(&["R1", "R2"]),
                    ..RegimeMatch::default()
                },
                0,
                10,
            ),
            rule(
                RegimeMatch {
                    any_of: ids(&["R1"]),
                    ..RegimeMatch::default()
                },
                1,
                1,
            ),
        ];
        let sets = sets(2);
        let chosen = route(&active(&["R1", "R2"]), &rules, &sets).unwrap();
        assert_eq!(chosen.set.id, "set0");
        assert_eq!(chosen.rule_index, 0);

        let chosen = route(&active(&["R1"]), &rules, &sets).unwrap();
        assert_eq!(chosen.set.id, "set1");
    }

    #[test]
    fn none_of_excludes() {
        let m = RegimeMatch {
            any_of: ids(&["trend"]),
            none_of: ids(&["chop"]),
            ..RegimeMatch::default()
        };
        assert!(m.matches(&active(&["trend"])));
        assert!(!m.matches(&active(&["trend", "chop"])));
        assert!(!m.matches(&active(&[])));
    }

    #[test]
    fn empty_match_is_catch_all() {
        assert!(RegimeMatch::default().matches(&active(&[])));
        assert!(RegimeMatch::default().matches(&active(&["x"])));
    }

    #[test]
    fn no_match_is_none() {
        let rules = vec![rule(
            RegimeMatch {
                all_of: ids(&["R1"]),
                ..RegimeMatch::default()
            },
            0,
            1,
        )];
        assert!(route(&active(&["R2"]), &rules, &sets(1)).is_none());
    }
}
