//! Platform configuration: the serde-deserializable object loaded from TOML
//! or JSON, and its compilation into immutable runtime structures.
//!
//! Everything in this module is validated once by [`PlatformConfig::compile`];
//! a run never sees an unvalidated definition.

pub mod compiled;

pub use compiled::{
    CompiledConfig, CompiledRegime, CompiledRule, CompiledStrategy, CompiledStrategySet,
};

use crate::condition::{ConditionLimits, ConditionSource};
use crate::domain::{Side, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_base_timeframe() -> Timeframe {
    Timeframe::H1
}

fn default_true() -> bool {
    true
}

/// The complete configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Timeframe of the bars driving the loop.
    #[serde(default = "default_base_timeframe")]
    pub base_timeframe: Timeframe,
    #[serde(default)]
    pub indicators: Vec<IndicatorDef>,
    /// Reusable named conditions, referenced as `{"ref": name}` or `@name`.
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionSource>,
    #[serde(default)]
    pub regimes: Vec<RegimeDefinition>,
    #[serde(default)]
    pub strategies: Vec<StrategyDefinition>,
    #[serde(default)]
    pub strategy_sets: Vec<StrategySetDefinition>,
    #[serde(default)]
    pub routing: Vec<RoutingRule>,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub limits: ConditionLimits,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// An externally computed indicator the snapshots will carry.
///
/// The engine never computes indicators; the declaration exists so conditions
/// can be checked for unknown ids at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Feed timeframe; `None` means the base timeframe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// Which decision a regime informs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeScope {
    /// Evaluated every bar; drives routing.
    #[default]
    Entry,
    /// Evaluated while a position is open; a committed exit regime closes it.
    Exit,
    /// Evaluated while a position is open; recorded in the regime history only.
    InTrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Higher wins; ties keep declaration order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scope: RegimeScope,
    pub condition: ConditionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    #[serde(default)]
    pub side: Side,
    pub entry: ConditionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ConditionSource>,
    #[serde(default)]
    pub risk: RiskConfig,
}

/// How the stop trails once activated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    #[default]
    None,
    /// Distance = `trailing_multiplier` percent of the best price since entry.
    Percent,
    /// Distance = indicator value × `trailing_multiplier` (e.g. ATR multiples).
    Indicator(String),
}

/// Per-strategy sizing and stop configuration. Percentages are in percent units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of current equity committed per trade.
    pub position_size: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub trailing_mode: TrailingMode,
    pub trailing_multiplier: f64,
    /// Favorable move from entry (percent) before trailing starts; 0 = immediately.
    pub trailing_activation_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_size: 1.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_mode: TrailingMode::None,
            trailing_multiplier: 1.0,
            trailing_activation_pct: 0.0,
        }
    }
}

/// Per-strategy patch applied by a strategy set. Absent fields keep the base value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_mode: Option<TrailingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_activation_pct: Option<f64>,
}

impl RiskOverride {
    pub fn apply(&self, base: &RiskConfig) -> RiskConfig {
        RiskConfig {
            position_size: self.position_size.unwrap_or(base.position_size),
            stop_loss_pct: self.stop_loss_pct.or(base.stop_loss_pct),
            take_profit_pct: self.take_profit_pct.or(base.take_profit_pct),
            trailing_mode: self
                .trailing_mode
                .clone()
                .unwrap_or_else(|| base.trailing_mode.clone()),
            trailing_multiplier: self.trailing_multiplier.unwrap_or(base.trailing_multiplier),
            trailing_activation_pct: self
                .trailing_activation_pct
                .unwrap_or(base.trailing_activation_pct),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySetDefinition {
    pub id: String,
    /// Strategy ids, evaluated in this order for entry.
    pub strategies: Vec<String>,
    /// Indicator id remapping applied to this set's strategies (`rsi → rsi_fast`).
    #[serde(default)]
    pub indicator_overrides: BTreeMap<String, String>,
    /// Risk patches keyed by strategy id.
    #[serde(default)]
    pub strategy_overrides: BTreeMap<String, RiskOverride>,
}

/// Regime-set match clauses. Every non-empty clause must hold; no clauses
/// matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegimeMatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub none_of: Vec<String>,
}

impl RegimeMatch {
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.all_of
            .iter()
            .chain(self.any_of.iter())
            .chain(self.none_of.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "match", default)]
    pub matcher: RegimeMatch,
    /// Strategy set id.
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    /// Close a trade opened under this rule once the rule stops matching.
    #[serde(default = "default_true")]
    pub exit_on_unmatch: bool,
}

/// Anti-flap hysteresis settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Consecutive bars a new regime set must persist before it is committed.
    pub confirm_bars: usize,
    /// Bars after a commit during which differing output is ignored.
    pub cooldown_bars: usize,
    /// Minimum bars a committed set must last before it can be replaced.
    pub min_segment_bars: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            confirm_bars: 3,
            cooldown_bars: 0,
            min_segment_bars: 0,
        }
    }
}

/// When an entry or exit decided at a bar's close is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillModel {
    /// Fill at the next bar's open; the trade is `Pending` in between.
    #[default]
    NextBarOpen,
    /// Fill at the deciding bar's close.
    SameBarClose,
}

/// Cost and fill assumptions for simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub initial_capital: f64,
    /// Fee as a fraction of notional, charged on every fill.
    pub fee_rate: f64,
    /// Adverse price adjustment per fill, in basis points.
    pub slippage_bps: f64,
    pub fill: FillModel,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            fee_rate: 0.0004,
            slippage_bps: 0.0,
            fill: FillModel::NextBarOpen,
        }
    }
}
