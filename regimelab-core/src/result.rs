//! Backtest result.

use crate::domain::Trade;
use crate::engine::{Diagnostics, EquityPoint, RegimeChange};
use crate::fingerprint::RunFingerprint;
use crate::metrics::PerformanceMetrics;
use serde::{Deserialize, Serialize};

/// Complete result of one symbol's backtest.
///
/// Contains:
/// - Closed trades in exit order
/// - Committed regime changes from both trackers
/// - Per-bar equity curve marked at the close
/// - Metrics, diagnostics and the run fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub bars: usize,
    pub trades: Vec<Trade>,
    pub regime_history: Vec<RegimeChange>,
    pub equity_curve: Vec<EquityPoint>,
    /// Cash after the end-of-data close-out.
    pub final_equity: f64,
    pub metrics: PerformanceMetrics,
    pub diagnostics: Diagnostics,
    pub fingerprint: RunFingerprint,
}

impl BacktestResult {
    /// Equity values only, in bar order.
    pub fn equity_values(&self) -> Vec<f64> {
        self.equity_curve.iter().map(|p| p.equity).collect()
    }

    pub fn net_pnl(&self) -> f64 {
        self.trades.iter().map(|t| t.net_pnl).sum()
    }
}
