//! Parameter sweep over stability and risk settings.
//!
//! Each grid point is a full copy of the base configuration with a few fields
//! replaced. Candidates compile independently and run in parallel with Rayon;
//! every candidate owns its engines and only shares the read-only input data,
//! so results are identical to running the grid sequentially and are returned
//! in grid order.

use rayon::prelude::*;
use regimelab_core::config::{PlatformConfig, RiskConfig};
use regimelab_core::engine::{run_backtest, BacktestInput, CancelToken};
use regimelab_core::error::EngineError;
use regimelab_core::metrics::PerformanceMetrics;
use regimelab_core::BacktestResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::RunnerError;

/// One swept parameter and the values it takes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "param", rename_all = "snake_case")]
pub enum GridAxis {
    ConfirmBars { values: Vec<usize> },
    CooldownBars { values: Vec<usize> },
    MinSegmentBars { values: Vec<usize> },
    FeeRate { values: Vec<f64> },
    StopLossPct { strategy: String, values: Vec<f64> },
    TakeProfitPct { strategy: String, values: Vec<f64> },
    TrailingMultiplier { strategy: String, values: Vec<f64> },
    PositionSize { strategy: String, values: Vec<f64> },
}

impl GridAxis {
    fn len(&self) -> usize {
        match self {
            GridAxis::ConfirmBars { values }
            | GridAxis::CooldownBars { values }
            | GridAxis::MinSegmentBars { values } => values.len(),
            GridAxis::FeeRate { values }
            | GridAxis::StopLossPct { values, .. }
            | GridAxis::TakeProfitPct { values, .. }
            | GridAxis::TrailingMultiplier { values, .. }
            | GridAxis::PositionSize { values, .. } => values.len(),
        }
    }

    /// Parameter label used in candidate ids, e.g. `stop_loss_pct[breakout]`.
    pub fn label(&self) -> String {
        match self {
            GridAxis::ConfirmBars { .. } => "confirm_bars".into(),
            GridAxis::CooldownBars { .. } => "cooldown_bars".into(),
            GridAxis::MinSegmentBars { .. } => "min_segment_bars".into(),
            GridAxis::FeeRate { .. } => "fee_rate".into(),
            GridAxis::StopLossPct { strategy, .. } => format!("stop_loss_pct[{strategy}]"),
            GridAxis::TakeProfitPct { strategy, .. } => format!("take_profit_pct[{strategy}]"),
            GridAxis::TrailingMultiplier { strategy, .. } => {
                format!("trailing_multiplier[{strategy}]")
            }
            GridAxis::PositionSize { strategy, .. } => format!("position_size[{strategy}]"),
        }
    }

    /// Write value `i` into `config`, returning it for the candidate's params.
    fn apply(&self, i: usize, config: &mut PlatformConfig) -> Result<f64, RunnerError> {
        let value = match self {
            GridAxis::ConfirmBars { values } => {
                config.stability.confirm_bars = values[i];
                values[i] as f64
            }
            GridAxis::CooldownBars { values } => {
                config.stability.cooldown_bars = values[i];
                values[i] as f64
            }
            GridAxis::MinSegmentBars { values } => {
                config.stability.min_segment_bars = values[i];
                values[i] as f64
            }
            GridAxis::FeeRate { values } => {
                config.execution.fee_rate = values[i];
                values[i]
            }
            GridAxis::StopLossPct { strategy, values } => {
                strategy_risk(config, strategy)?.stop_loss_pct = Some(values[i]);
                values[i]
            }
            GridAxis::TakeProfitPct { strategy, values } => {
                strategy_risk(config, strategy)?.take_profit_pct = Some(values[i]);
                values[i]
            }
            GridAxis::TrailingMultiplier { strategy, values } => {
                strategy_risk(config, strategy)?.trailing_multiplier = values[i];
                values[i]
            }
            GridAxis::PositionSize { strategy, values } => {
                strategy_risk(config, strategy)?.position_size = values[i];
                values[i]
            }
        };
        Ok(value)
    }
}

fn strategy_risk<'c>(config: &'c mut PlatformConfig, id: &str) -> Result<&'c mut RiskConfig, RunnerError> {
    config
        .strategies
        .iter_mut()
        .find(|s| s.id == id)
        .map(|s| &mut s.risk)
        .ok_or_else(|| RunnerError::Grid {
            reason: format!("unknown strategy '{id}'"),
        })
}

/// Cartesian product of axes. The first axis varies slowest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub axes: Vec<GridAxis>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(mut self, axis: GridAxis) -> Self {
        self.axes.push(axis);
        self
    }

    /// Returns the total number of configurations in this grid.
    pub fn size(&self) -> usize {
        self.axes.iter().map(GridAxis::len).product()
    }

    /// Generates all candidates in grid order.
    pub fn candidates(&self, base: &PlatformConfig) -> Result<Vec<SweepCandidate>, RunnerError> {
        if let Some(empty) = self.axes.iter().find(|a| a.len() == 0) {
            return Err(RunnerError::Grid {
                reason: format!("axis {} has no values", empty.label()),
            });
        }
        let mut candidates = Vec::with_capacity(self.size());
        for index in 0..self.size() {
            let mut config = base.clone();
            let mut params = BTreeMap::new();
            let mut stride = self.size();
            for axis in &self.axes {
                stride /= axis.len();
                let i = (index / stride) % axis.len();
                params.insert(axis.label(), axis.apply(i, &mut config)?);
            }
            candidates.push(SweepCandidate::new(index, params, config));
        }
        Ok(candidates)
    }
}

/// One grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepCandidate {
    pub index: usize,
    /// BLAKE3 of the params JSON (first 16 hex chars).
    pub id: String,
    pub params: BTreeMap<String, f64>,
    pub config: PlatformConfig,
}

impl SweepCandidate {
    fn new(index: usize, params: BTreeMap<String, f64>, config: PlatformConfig) -> Self {
        let json = serde_json::to_string(&params).expect("sweep params must serialize");
        let hash = blake3::hash(json.as_bytes()).to_hex().to_string();
        Self {
            index,
            id: hash[..16].to_string(),
            params,
            config,
        }
    }
}

/// A candidate's runs over every input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub index: usize,
    pub id: String,
    pub params: BTreeMap<String, f64>,
    /// One result per input, in input order.
    pub results: Vec<BacktestResult>,
}

impl CandidateResult {
    pub fn net_pnl(&self) -> f64 {
        self.results.iter().map(|r| r.net_pnl()).sum()
    }

    pub fn trade_count(&self) -> usize {
        self.results.iter().map(|r| r.trades.len()).sum()
    }

    /// Mean of a metric across inputs.
    pub fn mean_metric(&self, metric: impl Fn(&PerformanceMetrics) -> f64) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| metric(&r.metrics)).sum::<f64>() / self.results.len() as f64
    }
}

/// Results from a parameter sweep, in grid order.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub candidates: Vec<CandidateResult>,
}

impl SweepReport {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates sorted by `score`, best first; ties keep grid order.
    pub fn ranked(&self, score: impl Fn(&CandidateResult) -> f64) -> Vec<&CandidateResult> {
        let mut sorted: Vec<_> = self.candidates.iter().collect();
        sorted.sort_by(|a, b| score(b).total_cmp(&score(a)));
        sorted
    }
}

/// Parameter sweep executor.
pub struct ParamSweep {
    parallel: bool,
}

impl Default for ParamSweep {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamSweep {
    pub fn new() -> Self {
        Self { parallel: true }
    }

    /// Enables or disables parallel execution.
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Run every grid point over every input.
    ///
    /// `cancel` is checked before each candidate and, inside each backtest,
    /// once per bar. A cancelled sweep returns [`RunnerError::Cancelled`].
    pub fn run(
        &self,
        grid: &ParamGrid,
        base: &PlatformConfig,
        inputs: &[BacktestInput],
        cancel: Option<&CancelToken>,
    ) -> Result<SweepReport, RunnerError> {
        let candidates = grid.candidates(base)?;
        info!(
            candidates = candidates.len(),
            inputs = inputs.len(),
            parallel = self.parallel,
            "sweep started"
        );

        let run_one = |candidate: &SweepCandidate| run_candidate(candidate, inputs, cancel);
        let results = if self.parallel {
            // Every candidate runs to completion so the reported failure is
            // the lowest-index one, as in a sequential run.
            let outcomes: Vec<Result<CandidateResult, RunnerError>> =
                candidates.par_iter().map(run_one).collect();
            outcomes.into_iter().collect::<Result<Vec<_>, _>>()
        } else {
            candidates.iter().map(run_one).collect::<Result<Vec<_>, _>>()
        }?;

        info!(candidates = results.len(), "sweep finished");
        Ok(SweepReport {
            candidates: results,
        })
    }
}

fn run_candidate(
    candidate: &SweepCandidate,
    inputs: &[BacktestInput],
    cancel: Option<&CancelToken>,
) -> Result<CandidateResult, RunnerError> {
    if cancel.is_some_and(|c| c.is_cancelled()) {
        return Err(RunnerError::Cancelled);
    }
    let wrap = |source: RunnerError| RunnerError::Candidate {
        candidate: candidate.id.clone(),
        source: Box::new(source),
    };
    let compiled = Arc::new(candidate.config.compile().map_err(|e| wrap(e.into()))?);
    let mut results = Vec::with_capacity(inputs.len());
    for input in inputs {
        match run_backtest(&compiled, input, cancel) {
            Ok(result) => results.push(result),
            Err(EngineError::Cancelled { .. }) => return Err(RunnerError::Cancelled),
            Err(e) => return Err(wrap(e.into())),
        }
    }
    debug!(candidate = %candidate.id, index = candidate.index, "candidate finished");
    Ok(CandidateResult {
        index: candidate.index,
        id: candidate.id.clone(),
        params: candidate.params.clone(),
        results,
    })
}
