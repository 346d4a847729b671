//! Backtest driver: validates the input feed, then runs the per-bar step over
//! every bar in order and collects the result.

use super::cancel::CancelToken;
use super::step::SymbolEngine;
use crate::config::CompiledConfig;
use crate::domain::Bar;
use crate::error::{EngineError, FeedError};
use crate::fingerprint::{dataset_hash, result_hash, RunFingerprint};
use crate::metrics::PerformanceMetrics;
use crate::result::BacktestResult;
use crate::snapshot::align::check_disjoint_ids;
use crate::snapshot::{IndicatorSnapshot, SnapshotAligner, TimeframeFeed};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One symbol's historical data: base bars, one base snapshot per bar, and
/// any higher-timeframe snapshot feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestInput {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub snapshots: Vec<IndicatorSnapshot>,
    #[serde(default)]
    pub feeds: Vec<TimeframeFeed>,
}

impl BacktestInput {
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>, snapshots: Vec<IndicatorSnapshot>) -> Self {
        Self {
            symbol: symbol.into(),
            bars,
            snapshots,
            feeds: Vec::new(),
        }
    }

    pub fn with_feed(mut self, feed: TimeframeFeed) -> Self {
        self.feeds.push(feed);
        self
    }

    /// Reject feeds that cannot be simulated, before any bar runs.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.bars.is_empty() {
            return Err(FeedError::Empty);
        }
        if self.snapshots.len() != self.bars.len() {
            return Err(FeedError::SnapshotCount {
                bars: self.bars.len(),
                snapshots: self.snapshots.len(),
            });
        }
        for (index, bar) in self.bars.iter().enumerate() {
            if !bar.is_sane() {
                return Err(FeedError::InvalidBar { index });
            }
            if index > 0 && bar.close_time <= self.bars[index - 1].close_time {
                return Err(FeedError::OutOfOrder {
                    index,
                    close_time: bar.close_time,
                });
            }
        }
        check_disjoint_ids(&self.snapshots, &self.feeds)
    }
}

/// Run a backtest for one symbol.
///
/// Deterministic: the same compiled config and input always produce the same
/// result, including its `result_hash`. `cancel` is checked once per bar; a
/// cancelled run returns [`EngineError::Cancelled`] and no partial result.
pub fn run_backtest(
    config: &Arc<CompiledConfig>,
    input: &BacktestInput,
    cancel: Option<&CancelToken>,
) -> Result<BacktestResult, EngineError> {
    input.validate()?;
    let mut aligner = SnapshotAligner::new(config.base_timeframe, input.feeds.clone())?;
    let mut engine = SymbolEngine::new(input.symbol.clone(), Arc::clone(config));

    let num_bars = input.bars.len();
    let mut trades = Vec::new();
    let mut regime_history = Vec::new();
    let mut equity_curve = Vec::with_capacity(num_bars);

    info!(symbol = %input.symbol, bars = num_bars, config = %config.config_hash, "backtest started");

    for (t, (bar, base)) in input.bars.iter().zip(&input.snapshots).enumerate() {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            debug!(symbol = %input.symbol, bar_index = t, "backtest cancelled");
            return Err(EngineError::Cancelled { bar_index: t });
        }
        let snapshot = aligner.align(bar.close_time, base);
        let outcome = engine.step(bar, snapshot)?;
        trades.extend(outcome.closed);
        regime_history.extend(outcome.transitions);
        equity_curve.push(outcome.equity);
    }
    trades.extend(engine.finish());

    let final_equity = engine.state().cash;
    // The close-out at the last bar realizes exit costs the mark did not.
    if let Some(last) = equity_curve.last_mut() {
        last.cash = final_equity;
        last.equity = final_equity;
    }
    let values: Vec<f64> = equity_curve.iter().map(|p| p.equity).collect();
    let metrics = PerformanceMetrics::compute(&values, &trades, config.base_timeframe.periods_per_year());

    let fingerprint = RunFingerprint {
        config_hash: config.config_hash.clone(),
        dataset_hash: dataset_hash(&input.bars, &input.snapshots, &input.feeds),
        result_hash: result_hash(&trades, &regime_history, &equity_curve),
    };

    info!(
        symbol = %input.symbol,
        trades = trades.len(),
        regime_changes = regime_history.len(),
        final_equity,
        result = %fingerprint.result_hash,
        "backtest finished"
    );

    Ok(BacktestResult {
        symbol: input.symbol.clone(),
        bars: num_bars,
        trades,
        regime_history,
        equity_curve,
        final_equity,
        metrics,
        diagnostics: engine.diagnostics().clone(),
        fingerprint,
    })
}
