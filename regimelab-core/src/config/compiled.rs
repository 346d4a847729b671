//! Validated, immutable runtime form of [`PlatformConfig`].

use super::{
    ExecutionConfig, PlatformConfig, RegimeMatch, RegimeScope, RiskConfig, StabilityConfig,
    TrailingMode,
};
use crate::condition::{Condition, ConditionCompiler, ConditionLimits};
use crate::domain::{ConfigHash, Side, Timeframe};
use crate::error::ConfigError;
use crate::fingerprint::config_hash;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CompiledRegime {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub scope: RegimeScope,
    pub condition: Arc<Condition>,
}

#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    pub id: String,
    pub side: Side,
    pub entry: Arc<Condition>,
    pub exit: Option<Arc<Condition>>,
    pub risk: RiskConfig,
}

/// A strategy set with its indicator remapping and risk patches already applied.
#[derive(Debug, Clone)]
pub struct CompiledStrategySet {
    pub id: String,
    pub strategies: Vec<CompiledStrategy>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub matcher: RegimeMatch,
    /// Index into [`CompiledConfig::strategy_sets`].
    pub target: usize,
    pub priority: i32,
    pub exit_on_unmatch: bool,
    /// Position in the configuration file, for diagnostics.
    pub declared_at: usize,
}

/// Everything a run needs, validated and immutable.
///
/// Cheap to share across threads (`Arc` inside), so sweep workers and live
/// sessions hold references to a single instance.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub base_timeframe: Timeframe,
    /// Declaration order; the classifier sorts by priority itself.
    pub regimes: Vec<CompiledRegime>,
    pub strategy_sets: Vec<CompiledStrategySet>,
    /// Sorted by priority, highest first; ties keep declaration order.
    pub rules: Vec<CompiledRule>,
    pub stability: StabilityConfig,
    pub execution: ExecutionConfig,
    pub limits: ConditionLimits,
    /// Snapshots (current included) the longest look-back needs.
    pub history_capacity: usize,
    pub indicator_ids: BTreeSet<String>,
    pub config_hash: ConfigHash,
}

impl CompiledConfig {
    pub fn has_scope(&self, scope: RegimeScope) -> bool {
        self.regimes.iter().any(|r| r.scope == scope)
    }
}

impl PlatformConfig {
    /// Validate and compile. All configuration errors surface here.
    pub fn compile(&self) -> Result<CompiledConfig, ConfigError> {
        let indicator_ids = unique_ids("indicator", self.indicators.iter().map(|i| &i.id))?;
        for indicator in &self.indicators {
            if indicator.timeframe.is_some_and(|tf| tf < self.base_timeframe) {
                return Err(ConfigError::InvalidParameter {
                    context: format!("indicator '{}'", indicator.id),
                    reason: format!(
                        "timeframe is finer than the {} base timeframe",
                        self.base_timeframe
                    ),
                });
            }
        }
        validate_stability(&self.stability)?;
        validate_execution(&self.execution)?;

        let mut compiler = ConditionCompiler::new(self.limits)
            .with_named(&self.conditions)
            .with_indicators(&indicator_ids);

        // Named conditions are compiled on their own too, so an unused broken
        // definition still fails at load.
        for (name, source) in &self.conditions {
            compiler
                .compile(source)
                .map_err(|e| e.within(&format!("condition '{name}'")))?;
        }

        unique_ids("regime", self.regimes.iter().map(|r| &r.id))?;
        let regimes = self
            .regimes
            .iter()
            .map(|def| {
                let condition = compiler
                    .compile(&def.condition)
                    .map_err(|e| e.within(&format!("regime '{}'", def.id)))?;
                Ok(CompiledRegime {
                    id: def.id.clone(),
                    name: def.name.clone(),
                    priority: def.priority,
                    scope: def.scope,
                    condition,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        unique_ids("strategy", self.strategies.iter().map(|s| &s.id))?;
        let mut strategies: BTreeMap<&str, CompiledStrategy> = BTreeMap::new();
        for def in &self.strategies {
            let owner = format!("strategy '{}'", def.id);
            let entry = compiler.compile(&def.entry).map_err(|e| e.within(&owner))?;
            let exit = def
                .exit
                .as_ref()
                .map(|source| compiler.compile(source))
                .transpose()
                .map_err(|e| e.within(&owner))?;
            validate_risk(&def.risk, &indicator_ids, &owner)?;
            strategies.insert(
                &def.id,
                CompiledStrategy {
                    id: def.id.clone(),
                    side: def.side,
                    entry,
                    exit,
                    risk: def.risk.clone(),
                },
            );
        }

        unique_ids("strategy set", self.strategy_sets.iter().map(|s| &s.id))?;
        let mut strategy_sets = Vec::with_capacity(self.strategy_sets.len());
        for set in &self.strategy_sets {
            let owner = format!("strategy set '{}'", set.id);
            for (from, to) in &set.indicator_overrides {
                for id in [from, to] {
                    if !indicator_ids.contains(id) {
                        return Err(ConfigError::UnknownReference {
                            kind: "indicator",
                            id: id.clone(),
                            context: format!("{owner} indicator_overrides"),
                        });
                    }
                }
            }
            for strategy_id in set.strategy_overrides.keys() {
                if !set.strategies.contains(strategy_id) {
                    return Err(ConfigError::UnknownReference {
                        kind: "strategy",
                        id: strategy_id.clone(),
                        context: format!("{owner} strategy_overrides"),
                    });
                }
            }
            let mut members = Vec::with_capacity(set.strategies.len());
            for strategy_id in &set.strategies {
                let base = strategies.get(strategy_id.as_str()).ok_or_else(|| {
                    ConfigError::UnknownReference {
                        kind: "strategy",
                        id: strategy_id.clone(),
                        context: owner.clone(),
                    }
                })?;
                let mut strategy = base.clone();
                if !set.indicator_overrides.is_empty() {
                    strategy.entry = remapped(&strategy.entry, &set.indicator_overrides);
                    strategy.exit = strategy
                        .exit
                        .as_ref()
                        .map(|exit| remapped(exit, &set.indicator_overrides));
                    if let TrailingMode::Indicator(id) = &mut strategy.risk.trailing_mode {
                        if let Some(target) = set.indicator_overrides.get(id) {
                            *id = target.clone();
                        }
                    }
                }
                if let Some(patch) = set.strategy_overrides.get(strategy_id) {
                    strategy.risk = patch.apply(&strategy.risk);
                    validate_risk(
                        &strategy.risk,
                        &indicator_ids,
                        &format!("{owner} override for '{strategy_id}'"),
                    )?;
                }
                members.push(strategy);
            }
            strategy_sets.push(CompiledStrategySet {
                id: set.id.clone(),
                strategies: members,
            });
        }

        let regime_ids: BTreeSet<&str> = self.regimes.iter().map(|r| r.id.as_str()).collect();
        let mut rules = Vec::with_capacity(self.routing.len());
        for (declared_at, rule) in self.routing.iter().enumerate() {
            let context = format!("routing rule {declared_at}");
            let target = strategy_sets
                .iter()
                .position(|s| s.id == rule.target)
                .ok_or_else(|| ConfigError::UnknownReference {
                    kind: "strategy set",
                    id: rule.target.clone(),
                    context: context.clone(),
                })?;
            if let Some(unknown) = rule.matcher.ids().find(|id| !regime_ids.contains(id.as_str())) {
                return Err(ConfigError::UnknownReference {
                    kind: "regime",
                    id: unknown.clone(),
                    context,
                });
            }
            rules.push(CompiledRule {
                matcher: rule.matcher.clone(),
                target,
                priority: rule.priority,
                exit_on_unmatch: rule.exit_on_unmatch,
                declared_at,
            });
        }
        // Stable sort keeps declaration order among equal priorities.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let history_capacity = regimes
            .iter()
            .map(|r| r.condition.lookback())
            .chain(strategy_sets.iter().flat_map(|set| {
                set.strategies.iter().flat_map(|s| {
                    std::iter::once(s.entry.lookback())
                        .chain(s.exit.as_ref().map(|e| e.lookback()))
                })
            }))
            .max()
            .unwrap_or(1)
            .max(1);

        Ok(CompiledConfig {
            base_timeframe: self.base_timeframe,
            regimes,
            strategy_sets,
            rules,
            stability: self.stability,
            execution: self.execution.clone(),
            limits: self.limits,
            history_capacity,
            indicator_ids,
            config_hash: config_hash(self),
        })
    }
}

fn remapped(condition: &Arc<Condition>, aliases: &BTreeMap<String, String>) -> Arc<Condition> {
    let mut copy = (**condition).clone();
    copy.remap_indicators(aliases);
    Arc::new(copy)
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a String>,
) -> Result<BTreeSet<String>, ConfigError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ConfigError::InvalidParameter {
                context: kind.to_string(),
                reason: "empty id".to_string(),
            });
        }
        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateId {
                kind,
                id: id.clone(),
            });
        }
    }
    Ok(seen)
}

fn invalid(context: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        context: context.to_string(),
        reason: reason.into(),
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn validate_risk(
    risk: &RiskConfig,
    indicators: &BTreeSet<String>,
    context: &str,
) -> Result<(), ConfigError> {
    if !positive(risk.position_size) {
        return Err(invalid(context, "position_size must be positive"));
    }
    if risk.stop_loss_pct.is_some_and(|p| !positive(p) || p >= 100.0) {
        return Err(invalid(context, "stop_loss_pct must be in (0, 100)"));
    }
    if risk.take_profit_pct.is_some_and(|p| !positive(p)) {
        return Err(invalid(context, "take_profit_pct must be positive"));
    }
    if !positive(risk.trailing_multiplier) {
        return Err(invalid(context, "trailing_multiplier must be positive"));
    }
    if !risk.trailing_activation_pct.is_finite() || risk.trailing_activation_pct < 0.0 {
        return Err(invalid(context, "trailing_activation_pct must be non-negative"));
    }
    if let TrailingMode::Indicator(id) = &risk.trailing_mode {
        if !indicators.contains(id) {
            return Err(ConfigError::UnknownReference {
                kind: "indicator",
                id: id.clone(),
                context: format!("{context} trailing_mode"),
            });
        }
    }
    if risk.trailing_mode == TrailingMode::Percent && risk.trailing_multiplier >= 100.0 {
        return Err(invalid(context, "percent trailing distance must be below 100"));
    }
    Ok(())
}

fn validate_stability(stability: &StabilityConfig) -> Result<(), ConfigError> {
    if stability.confirm_bars == 0 {
        return Err(invalid("stability", "confirm_bars must be at least 1"));
    }
    Ok(())
}

fn validate_execution(execution: &ExecutionConfig) -> Result<(), ConfigError> {
    if !positive(execution.initial_capital) {
        return Err(invalid("execution", "initial_capital must be positive"));
    }
    if !execution.fee_rate.is_finite() || execution.fee_rate < 0.0 {
        return Err(invalid("execution", "fee_rate must be non-negative"));
    }
    if !execution.slippage_bps.is_finite() || execution.slippage_bps < 0.0 {
        return Err(invalid("execution", "slippage_bps must be non-negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> serde_json::Value {
        serde_json::json!({
            "indicators": [
                {"id": "rsi", "type": "rsi"},
                {"id": "rsi_fast", "type": "rsi", "params": {"period": 7}},
                {"id": "atr", "type": "atr"}
            ],
            "conditions": {"overbought": "rsi > 70"},
            "regimes": [
                {"id": "low", "priority": 1, "condition": "rsi < 30"},
                {"id": "high", "priority": 5, "condition": "@overbought"}
            ],
            "strategies": [
                {"id": "breakout", "entry": "rsi > 75", "exit": "rsi < 50",
                 "risk": {"stop_loss_pct": 2.0, "trailing_mode": {"indicator": "atr"}}}
            ],
            "strategy_sets": [
                {"id": "default", "strategies": ["breakout"]},
                {"id": "fast", "strategies": ["breakout"],
                 "indicator_overrides": {"rsi": "rsi_fast"},
                 "strategy_overrides": {"breakout": {"position_size": 0.25}}}
            ],
            "routing": [
                {"match": {"any_of": ["low"]}, "target": "default", "priority": 1},
                {"match": {"all_of": ["high"]}, "target": "fast", "priority": 9},
                {"match": {}, "target": "default", "priority": 1}
            ]
        })
    }

    fn compile(value: serde_json::Value) -> Result<CompiledConfig, ConfigError> {
        serde_json::from_value::<PlatformConfig>(value).unwrap().compile()
    }

    #[test]
    fn compiles_and_orders_rules() {
        let compiled = compile(base_json()).unwrap();
        let order: Vec<usize> = compiled.rules.iter().map(|r| r.declared_at).collect();
        assert_eq!(order, vec![1, 0, 2]);
        assert_eq!(compiled.rules[0].target, 1);
        assert_eq!(compiled.history_capacity, 1);
    }

    #[test]
    fn overrides_remap_indicators_and_patch_risk() {
        let compiled = compile(base_json()).unwrap();
        let fast = &compiled.strategy_sets[1].strategies[0];
        let ids: Vec<String> = fast.entry.indicator_ids().into_iter().collect();
        assert_eq!(ids, vec!["rsi_fast".to_string()]);
        assert_eq!(fast.risk.position_size, 0.25);
        assert_eq!(fast.risk.stop_loss_pct, Some(2.0));

        let plain = &compiled.strategy_sets[0].strategies[0];
        assert!(plain.entry.indicator_ids().contains("rsi"));
        assert_eq!(plain.risk.position_size, 1.0);
    }

    #[test]
    fn duplicate_regime_rejected() {
        let mut json = base_json();
        json["regimes"][1]["id"] = "low".into();
        assert_eq!(
            compile(json).unwrap_err(),
            ConfigError::DuplicateId {
                kind: "regime",
                id: "low".into()
            }
        );
    }

    #[test]
    fn unknown_indicator_in_regime_names_owner() {
        let mut json = base_json();
        json["regimes"][0]["condition"] = "adx > 25".into();
        let err = compile(json).unwrap_err();
        assert!(err.to_string().contains("regime 'low'"), "{err}");
    }

    #[test]
    fn routing_to_unknown_regime_rejected() {
        let mut json = base_json();
        json["routing"][0]["match"] = serde_json::json!({"any_of": ["ghost"]});
        assert!(matches!(
            compile(json),
            Err(ConfigError::UnknownReference { kind: "regime", .. })
        ));
    }

    #[test]
    fn routing_to_unknown_set_rejected() {
        let mut json = base_json();
        json["routing"][0]["target"] = "nope".into();
        assert!(matches!(
            compile(json),
            Err(ConfigError::UnknownReference { kind: "strategy set", .. })
        ));
    }

    #[test]
    fn zero_confirm_bars_rejected() {
        let mut json = base_json();
        json["stability"] = serde_json::json!({"confirm_bars": 0});
        assert!(matches!(compile(json), Err(ConfigError::InvalidParameter { .. })));
    }

    #[test]
    fn history_capacity_follows_lookback() {
        let mut json = base_json();
        json["strategies"][0]["entry"] = "crossover(rsi, percentile(rsi, 20, 80))".into();
        let compiled = compile(json).unwrap();
        assert_eq!(compiled.history_capacity, 21);
    }

    #[test]
    fn config_hash_is_stable() {
        let a = compile(base_json()).unwrap();
        let b = compile(base_json()).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
        let mut json = base_json();
        json["stability"] = serde_json::json!({"confirm_bars": 5});
        assert_ne!(compile(json).unwrap().config_hash, a.config_hash);
    }
}
