//! Composite regime classification.
//!
//! Pure and stateless: every regime of the requested scope is evaluated
//! independently and all satisfied ids are returned, highest priority first.

use crate::condition::evaluate;
use crate::config::{CompiledRegime, RegimeScope};
use crate::domain::RegimeId;
use crate::error::DataError;
use crate::snapshot::SnapshotHistory;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Regime ids satisfied on one bar, priority-descending, ties by declaration order.
///
/// Empty is a valid (neutral) classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveRegimeSet(Vec<RegimeId>);

impl ActiveRegimeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from ids already in priority order.
    pub fn from_ordered(ids: Vec<RegimeId>) -> Self {
        Self(ids)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|r| r == id)
    }

    pub fn ids(&self) -> &[RegimeId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ActiveRegimeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{{}}}", self.0.join(", "))
    }
}

/// Classify one scope.
pub fn classify(
    regimes: &[CompiledRegime],
    history: &SnapshotHistory,
    scope: RegimeScope,
) -> Result<ActiveRegimeSet, DataError> {
    classify_scopes(regimes, history, &[scope])
}

/// Classify several scopes into one combined set.
pub fn classify_scopes(
    regimes: &[CompiledRegime],
    history: &SnapshotHistory,
    scopes: &[RegimeScope],
) -> Result<ActiveRegimeSet, DataError> {
    let mut satisfied: Vec<&CompiledRegime> = Vec::new();
    for regime in regimes.iter().filter(|r| scopes.contains(&r.scope)) {
        if evaluate(&regime.condition, history)? {
            satisfied.push(regime);
        }
    }
    // Stable: equal priorities keep declaration order.
    satisfied.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(ActiveRegimeSet(
        satisfied.into_iter().map(|r| r.id.clone()).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::snapshot::IndicatorSnapshot;
    use std::sync::Arc;

    fn regime(id: &str, priority: i32, scope: RegimeScope, cond: &str) -> CompiledRegime {
        CompiledRegime {
            id: id.into(),
            name: id.into(),
            priority,
            scope,
            condition: Arc::new(Condition::parse(cond).unwrap()),
        }
    }

    fn history(adx: f64, rsi: f64) -> SnapshotHistory {
        SnapshotHistory::single(IndicatorSnapshot::new().with("adx", adx).with("rsi", rsi))
    }

    #[test]
    fn returns_all_satisfied_by_priority_then_declaration() {
        let regimes = vec![
            regime("trend", 1, RegimeScope::Entry, "adx > 25"),
            regime("hot", 5, RegimeScope::Entry, "rsi > 70"),
            regime("strong", 1, RegimeScope::Entry, "adx > 40"),
            regime("cold", 9, RegimeScope::Entry, "rsi < 30"),
        ];
        let set = classify(&regimes, &history(45.0, 80.0), RegimeScope::Entry).unwrap();
        assert_eq!(set.ids(), ["hot", "trend", "strong"]);
    }

    #[test]
    fn filters_by_scope() {
        let regimes = vec![
            regime("trend", 1, RegimeScope::Entry, "adx > 25"),
            regime("blowoff", 1, RegimeScope::Exit, "rsi > 90"),
        ];
        let h = history(30.0, 95.0);
        assert_eq!(classify(&regimes, &h, RegimeScope::Entry).unwrap().ids(), ["trend"]);
        assert_eq!(classify(&regimes, &h, RegimeScope::Exit).unwrap().ids(), ["blowoff"]);
        let both = classify_scopes(&regimes, &h, &[RegimeScope::Exit, RegimeScope::Entry]).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn empty_result_is_neutral() {
        let regimes = vec![regime("trend", 1, RegimeScope::Entry, "adx > 25")];
        let set = classify(&regimes, &history(10.0, 50.0), RegimeScope::Entry).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "{}");
    }

    #[test]
    fn missing_data_propagates() {
        let regimes = vec![regime("vol", 1, RegimeScope::Entry, "atr > 1")];
        assert!(classify(&regimes, &history(10.0, 50.0), RegimeScope::Entry).is_err());
    }
}
