//! Anti-flap hysteresis over classifier output.
//!
//! A new regime set must be observed on `confirm_bars` consecutive bars before
//! it replaces the current one. Changes are also blocked for `cooldown_bars`
//! after a commit and until the current segment has lasted `min_segment_bars`.

use super::classifier::ActiveRegimeSet;
use crate::config::StabilityConfig;
use serde::{Deserialize, Serialize};

/// A committed change of the stable regime set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeTransition {
    pub from: ActiveRegimeSet,
    pub to: ActiveRegimeSet,
    /// Consecutive observations that confirmed `to`.
    pub confirmed_after: usize,
}

/// Per symbol/timeframe tracker state. The only mutable cross-bar
/// classification state in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableRegimeState {
    pub current: ActiveRegimeSet,
    pub pending: Option<ActiveRegimeSet>,
    pub confirm_count: usize,
    pub bars_since_change: usize,
}

impl StableRegimeState {
    /// Neutral start. The initial segment counts as already past cooldown and
    /// minimum duration, so the first confirmed set commits immediately.
    pub fn new(config: &StabilityConfig) -> Self {
        Self {
            current: ActiveRegimeSet::empty(),
            pending: None,
            confirm_count: 0,
            bars_since_change: config.cooldown_bars.max(config.min_segment_bars),
        }
    }

    pub fn current(&self) -> &ActiveRegimeSet {
        &self.current
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one bar of classifier output. Returns the transition if this bar commits one.
    pub fn update(
        &mut self,
        observed: ActiveRegimeSet,
        config: &StabilityConfig,
    ) -> Option<RegimeTransition> {
        self.bars_since_change = self.bars_since_change.saturating_add(1);

        if observed == self.current {
            self.pending = None;
            self.confirm_count = 0;
            return None;
        }
        if self.bars_since_change < config.cooldown_bars {
            return None;
        }

        if self.pending.as_ref() == Some(&observed) {
            self.confirm_count += 1;
        } else {
            self.pending = Some(observed);
            self.confirm_count = 1;
        }

        if self.confirm_count >= config.confirm_bars
            && self.bars_since_change >= config.min_segment_bars
        {
            let to = self.pending.take()?;
            let from = std::mem::replace(&mut self.current, to.clone());
            let confirmed_after = self.confirm_count;
            self.confirm_count = 0;
            self.bars_since_change = 0;
            return Some(RegimeTransition {
                from,
                to,
                confirmed_after,
            });
        }
        None
    }
}
