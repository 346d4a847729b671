//! Load-time compilation: source forms → typed, bounded [`Condition`] trees.
//!
//! Every structural check (unknown function/operator, arity, boolean vs
//! numeric position, depth/width, percentile window, unknown indicator,
//! reference cycles) happens here. Evaluation never re-checks any of it.

use super::ast::{
    CompareOp, Comparison, Condition, FunctionCall, GroupLogic, IndicatorRef, Operand, Test,
};
use super::functions::{Builtin, ValueType};
use super::parser::parse_expression;
use super::source::{CallSource, CompareSource, ConditionNode, ConditionSource, OperandSource};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Structural bounds applied to untrusted condition trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionLimits {
    /// Maximum nesting of groups, `not`, and function calls.
    pub max_depth: usize,
    /// Maximum children of a group or arguments of a call.
    pub max_width: usize,
    /// Largest `percentile` window.
    pub max_window: usize,
    /// Most nodes one condition may expand to once named references are inlined.
    pub max_nodes: usize,
}

impl Default for ConditionLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_width: 64,
            max_window: 1000,
            max_nodes: 10_000,
        }
    }
}

/// Compiled conditions keyed by the BLAKE3 hash of their canonical form.
///
/// Text and structured sources that decode to the same tree share an entry.
#[derive(Debug, Default)]
pub struct ConditionCache {
    entries: HashMap<String, Arc<Condition>>,
    hits: usize,
}

impl ConditionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served without recompiling.
    pub fn hits(&self) -> usize {
        self.hits
    }

    fn get(&mut self, key: &str) -> Option<Arc<Condition>> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    fn insert(&mut self, key: String, condition: Arc<Condition>) {
        self.entries.insert(key, condition);
    }
}

/// Canonical identity of a condition tree.
pub fn cache_key(node: &ConditionNode) -> String {
    let json = serde_json::to_vec(node).expect("ConditionNode must serialize");
    blake3::hash(&json).to_hex().to_string()
}

/// A named condition compiled once, independent of where it is referenced.
#[derive(Debug)]
struct ResolvedRef {
    condition: Arc<Condition>,
    /// Levels the condition occupies below the referencing position.
    height: usize,
    /// Expanded node count.
    nodes: usize,
}

/// Compiles condition sources against a fixed set of named conditions and
/// (optionally) a fixed set of known indicator ids.
pub struct ConditionCompiler<'a> {
    limits: ConditionLimits,
    named: Option<&'a BTreeMap<String, ConditionSource>>,
    indicators: Option<&'a BTreeSet<String>>,
    cache: ConditionCache,
    resolved: BTreeMap<String, ResolvedRef>,
    resolving: Vec<String>,
    /// Nodes expanded so far for the condition being compiled.
    nodes: usize,
    /// Deepest level reached so far for the condition being compiled.
    deepest: usize,
}

impl<'a> ConditionCompiler<'a> {
    pub fn new(limits: ConditionLimits) -> Self {
        Self {
            limits,
            named: None,
            indicators: None,
            cache: ConditionCache::new(),
            resolved: BTreeMap::new(),
            resolving: Vec::new(),
            nodes: 0,
            deepest: 0,
        }
    }

    /// Named conditions available to `{"ref": …}` / `@name`.
    pub fn with_named(mut self, named: &'a BTreeMap<String, ConditionSource>) -> Self {
        self.named = Some(named);
        self
    }

    /// Reject references to indicator ids outside `ids`.
    pub fn with_indicators(mut self, ids: &'a BTreeSet<String>) -> Self {
        self.indicators = Some(ids);
        self
    }

    pub fn limits(&self) -> &ConditionLimits {
        &self.limits
    }

    pub fn cache(&self) -> &ConditionCache {
        &self.cache
    }

    pub fn compile(&mut self, source: &ConditionSource) -> Result<Arc<Condition>, ConfigError> {
        let node = self.decode(source)?;
        let key = cache_key(&node);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        self.nodes = 0;
        self.deepest = 0;
        let condition = Arc::new(self.build(&node, 1)?);
        self.cache.insert(key, Arc::clone(&condition));
        Ok(condition)
    }

    fn decode(&self, source: &ConditionSource) -> Result<ConditionNode, ConfigError> {
        match source {
            ConditionSource::Text(text) => parse_expression(text, &self.limits),
            ConditionSource::Node(node) => Ok(node.clone()),
        }
    }

    fn check_depth(&mut self, depth: usize) -> Result<(), ConfigError> {
        self.deepest = self.deepest.max(depth);
        if depth > self.limits.max_depth {
            return Err(ConfigError::DepthExceeded {
                depth,
                limit: self.limits.max_depth,
            });
        }
        Ok(())
    }

    fn check_width(&self, width: usize) -> Result<(), ConfigError> {
        if width > self.limits.max_width {
            return Err(ConfigError::WidthExceeded {
                width,
                limit: self.limits.max_width,
            });
        }
        Ok(())
    }

    fn build_source(&mut self, source: &ConditionSource, depth: usize) -> Result<Condition, ConfigError> {
        let node = self.decode(source)?;
        self.build(&node, depth)
    }

    /// Count `count` more expanded nodes against the budget.
    fn charge(&mut self, count: usize) -> Result<(), ConfigError> {
        self.nodes += count;
        if self.nodes > self.limits.max_nodes {
            return Err(ConfigError::TooManyNodes {
                limit: self.limits.max_nodes,
            });
        }
        Ok(())
    }

    fn build(&mut self, node: &ConditionNode, depth: usize) -> Result<Condition, ConfigError> {
        self.check_depth(depth)?;
        if !matches!(node, ConditionNode::Ref(_)) {
            self.charge(1)?;
        }
        match node {
            ConditionNode::All(children) => self.build_group(GroupLogic::All, children, depth),
            ConditionNode::Any(children) => self.build_group(GroupLogic::Any, children, depth),
            ConditionNode::None(children) => self.build_group(GroupLogic::None, children, depth),
            ConditionNode::Not(inner) => {
                let child = self.build_source(inner, depth + 1)?;
                Ok(Condition::Group {
                    logic: GroupLogic::None,
                    children: vec![child],
                })
            }
            ConditionNode::Compare(compare) => self.build_compare(compare, depth),
            ConditionNode::Call(call) => {
                let compiled = self.build_call(call, depth)?;
                expect_type(
                    ValueType::Bool,
                    compiled.function.returns(),
                    || format!("condition '{}'", compiled),
                )?;
                Ok(Condition::Call(compiled))
            }
            ConditionNode::Ref(name) => self.build_ref(name, depth),
        }
    }

    fn build_group(
        &mut self,
        logic: GroupLogic,
        children: &[ConditionSource],
        depth: usize,
    ) -> Result<Condition, ConfigError> {
        self.check_width(children.len())?;
        let children = children
            .iter()
            .map(|child| self.build_source(child, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Condition::Group { logic, children })
    }

    fn build_ref(&mut self, name: &str, depth: usize) -> Result<Condition, ConfigError> {
        if !self.resolved.contains_key(name) {
            let entry = self
                .resolve_named(name)
                .map_err(|e| e.within(&format!("condition '{name}'")))?;
            self.resolved.insert(name.to_string(), entry);
        }
        let Some(entry) = self.resolved.get(name) else {
            return Err(ConfigError::UnknownReference {
                kind: "condition",
                id: name.to_string(),
                context: "reference".to_string(),
            });
        };
        let (condition, height, nodes) = (Arc::clone(&entry.condition), entry.height, entry.nodes);
        self.check_depth(depth + height - 1)?;
        self.charge(nodes)?;
        Ok(condition.as_ref().clone())
    }

    /// Compile a named condition on its own, starting at depth 1, and record
    /// its height and expanded size for every later reference.
    fn resolve_named(&mut self, name: &str) -> Result<ResolvedRef, ConfigError> {
        if self.resolving.iter().any(|n| n == name) {
            let mut chain = self.resolving.clone();
            chain.push(name.to_string());
            return Err(ConfigError::CyclicReference { chain });
        }
        let source = self
            .named
            .and_then(|named| named.get(name))
            .ok_or_else(|| ConfigError::UnknownReference {
                kind: "condition",
                id: name.to_string(),
                context: "reference".to_string(),
            })?;
        let (outer_nodes, outer_deepest) = (self.nodes, self.deepest);
        self.nodes = 0;
        self.deepest = 0;
        self.resolving.push(name.to_string());
        let built = self.build_source(source, 1);
        self.resolving.pop();
        let entry = ResolvedRef {
            condition: Arc::new(built?),
            height: self.deepest,
            nodes: self.nodes,
        };
        self.nodes = outer_nodes;
        self.deepest = outer_deepest;
        Ok(entry)
    }

    fn build_compare(&mut self, compare: &CompareSource, depth: usize) -> Result<Condition, ConfigError> {
        let left = self.build_operand(&compare.left, depth + 1)?;
        let test = if compare.op == "between" {
            let (Some(low), Some(high)) = (&compare.low, &compare.high) else {
                return Err(ConfigError::InvalidParameter {
                    context: format!("comparison on '{left}'"),
                    reason: "'between' requires both 'low' and 'high'".to_string(),
                });
            };
            Test::Between {
                low: self.build_operand(low, depth + 1)?,
                high: self.build_operand(high, depth + 1)?,
            }
        } else {
            let op = CompareOp::from_name(&compare.op).ok_or_else(|| ConfigError::UnknownOperator {
                op: compare.op.clone(),
            })?;
            let Some(right) = &compare.right else {
                return Err(ConfigError::InvalidParameter {
                    context: format!("comparison on '{left}'"),
                    reason: format!("operator '{}' requires 'right'", op.symbol()),
                });
            };
            Test::Binary {
                op,
                right: self.build_operand(right, depth + 1)?,
            }
        };
        Ok(Condition::Compare(Comparison { left, test }))
    }

    fn build_operand(&mut self, source: &OperandSource, depth: usize) -> Result<Operand, ConfigError> {
        self.check_depth(depth)?;
        self.charge(1)?;
        match source {
            OperandSource::Number(v) => Ok(Operand::Literal(*v)),
            OperandSource::Series(values) => {
                if values.is_empty() {
                    return Err(ConfigError::InvalidParameter {
                        context: "series literal".to_string(),
                        reason: "must not be empty".to_string(),
                    });
                }
                self.check_width(values.len())?;
                Ok(Operand::Series(values.clone()))
            }
            OperandSource::Reference(reference) => {
                let r = IndicatorRef::parse(reference);
                if r.id.is_empty() || r.field.as_deref() == Some("") {
                    return Err(ConfigError::InvalidParameter {
                        context: format!("reference '{reference}'"),
                        reason: "empty indicator id or field".to_string(),
                    });
                }
                if let Some(known) = self.indicators {
                    if !known.contains(&r.id) {
                        return Err(ConfigError::UnknownReference {
                            kind: "indicator",
                            id: r.id,
                            context: "condition".to_string(),
                        });
                    }
                }
                Ok(Operand::Indicator(r))
            }
            OperandSource::Call { call } => {
                let compiled = self.build_call(call, depth)?;
                expect_type(
                    ValueType::Number,
                    compiled.function.returns(),
                    || format!("operand '{}'", compiled),
                )?;
                Ok(Operand::Call(Box::new(compiled)))
            }
        }
    }

    fn build_call(&mut self, call: &CallSource, depth: usize) -> Result<FunctionCall, ConfigError> {
        self.check_depth(depth)?;
        let function = Builtin::from_name(&call.name).ok_or_else(|| ConfigError::UnknownFunction {
            name: call.name.clone(),
        })?;
        let arity = function.arity();
        if !arity.accepts(call.args.len()) {
            return Err(ConfigError::Arity {
                function: call.name.clone(),
                expected: arity.to_string(),
                found: call.args.len(),
            });
        }
        self.check_width(call.args.len())?;
        let args = call
            .args
            .iter()
            .map(|arg| self.build_operand(arg, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;

        if function == Builtin::Percentile {
            self.check_percentile_args(&args)?;
        }
        Ok(FunctionCall { function, args })
    }

    fn check_percentile_args(&self, args: &[Operand]) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParameter {
            context: "percentile".to_string(),
            reason,
        };
        match args.get(1) {
            Some(Operand::Literal(w))
                if w.fract() == 0.0 && *w >= 1.0 && *w <= self.limits.max_window as f64 => {}
            Some(Operand::Literal(w)) => {
                return Err(invalid(format!(
                    "window {w} must be an integer in 1..={}",
                    self.limits.max_window
                )))
            }
            _ => return Err(invalid("window must be a numeric literal".to_string())),
        }
        match args.get(2) {
            Some(Operand::Literal(p)) if (0.0..=100.0).contains(p) => Ok(()),
            Some(Operand::Literal(p)) => Err(invalid(format!("pct {p} must be in 0..=100"))),
            _ => Err(invalid("pct must be a numeric literal".to_string())),
        }
    }
}

fn expect_type(
    expected: ValueType,
    found: ValueType,
    context: impl FnOnce() -> String,
) -> Result<(), ConfigError> {
    if expected == found {
        return Ok(());
    }
    Err(ConfigError::TypeMismatch {
        context: context(),
        expected: expected.name(),
        found: found.name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(text: &str) -> Result<Arc<Condition>, ConfigError> {
        ConditionCompiler::new(ConditionLimits::default()).compile(&ConditionSource::from(text))
    }

    #[test]
    fn text_and_structured_forms_share_cache_entry() {
        let mut compiler = ConditionCompiler::new(ConditionLimits::default());
        let text = ConditionSource::from("rsi > 70");
        let structured: ConditionSource =
            serde_json::from_str(r#"{"compare": {"left": "rsi", "op": ">", "right": 70}}"#).unwrap();
        let a = compiler.compile(&text).unwrap();
        let b = compiler.compile(&structured).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(compiler.cache().len(), 1);
        assert_eq!(compiler.cache().hits(), 1);
    }

    #[test]
    fn unknown_function_rejected() {
        assert_eq!(
            compile("exec(rsi)").unwrap_err(),
            ConfigError::UnknownFunction { name: "exec".into() }
        );
    }

    #[test]
    fn unknown_operator_rejected() {
        let source: ConditionSource =
            serde_json::from_str(r#"{"compare": {"left": "rsi", "op": "approx", "right": 70}}"#).unwrap();
        let err = ConditionCompiler::new(ConditionLimits::default())
            .compile(&source)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOperator { op: "approx".into() });
    }

    #[test]
    fn arity_checked() {
        let err = compile("crossover(a)").unwrap_err();
        assert!(matches!(err, ConfigError::Arity { found: 1, .. }));
    }

    #[test]
    fn numeric_call_in_boolean_position_rejected() {
        let err = compile("coalesce(rsi, 50)").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TypeMismatch { expected: "boolean", found: "number", .. }
        ));
    }

    #[test]
    fn boolean_call_in_numeric_position_rejected() {
        let err = compile("is_null(rsi) > 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TypeMismatch { expected: "number", found: "boolean", .. }
        ));
    }

    #[test]
    fn percentile_window_bounded() {
        assert!(compile("percentile(atr, 20, 80) > atr").is_ok());
        assert!(matches!(
            compile("percentile(atr, 5000, 80) > atr"),
            Err(ConfigError::InvalidParameter { .. })
        ));
        assert!(matches!(
            compile("percentile(atr, atr, 80) > atr"),
            Err(ConfigError::InvalidParameter { .. })
        ));
        assert!(matches!(
            compile("percentile(atr, 20, 120) > atr"),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn width_limit_enforced() {
        let limits = ConditionLimits {
            max_width: 2,
            ..ConditionLimits::default()
        };
        let err = ConditionCompiler::new(limits)
            .compile(&ConditionSource::from("a > 1 and b > 1 and c > 1"))
            .unwrap_err();
        assert_eq!(err, ConfigError::WidthExceeded { width: 3, limit: 2 });
    }

    #[test]
    fn depth_limit_enforced_for_structured_input() {
        let mut source = ConditionSource::from("rsi > 1");
        for _ in 0..20 {
            source = ConditionSource::Node(ConditionNode::Not(Box::new(source)));
        }
        let err = ConditionCompiler::new(ConditionLimits::default())
            .compile(&source)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DepthExceeded { limit: 16, .. }));
    }

    #[test]
    fn unknown_indicator_rejected() {
        let known = BTreeSet::from(["rsi".to_string()]);
        let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_indicators(&known);
        assert!(compiler.compile(&ConditionSource::from("rsi.signal > 1")).is_ok());
        let err = compiler.compile(&ConditionSource::from("adx > 25")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { kind: "indicator", .. }));
    }

    #[test]
    fn named_references_inline_and_detect_cycles() {
        let named = BTreeMap::from([
            ("hot".to_string(), ConditionSource::from("rsi > 70")),
            ("loop_a".to_string(), ConditionSource::from("@loop_b")),
            ("loop_b".to_string(), ConditionSource::from("rsi > 1 and @loop_a")),
        ]);
        let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_named(&named);

        let inlined = compiler.compile(&ConditionSource::from("@hot")).unwrap();
        assert!(matches!(inlined.as_ref(), Condition::Compare(_)));

        let err = compiler.compile(&ConditionSource::from("@loop_a")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::CyclicReference {
                chain: vec!["loop_a".into(), "loop_b".into(), "loop_a".into()]
            }
        );

        let err = compiler.compile(&ConditionSource::from("@missing")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { kind: "condition", .. }));
    }

    /// `a0` references `a1` ten times, `a1` references `a2` ten times, and so
    /// on: each level is within the width and depth limits, but fully inlined
    /// the tree would hold ten million comparisons.
    fn fan_out_chain(levels: usize) -> BTreeMap<String, ConditionSource> {
        let mut named = BTreeMap::new();
        for k in 0..levels {
            let refs = vec![format!("@a{}", k + 1); 10].join(" and ");
            named.insert(format!("a{k}"), ConditionSource::from(refs.as_str()));
        }
        named.insert(format!("a{levels}"), ConditionSource::from("rsi > 1"));
        named
    }

    #[test]
    fn nested_references_fail_at_node_budget() {
        let named = fan_out_chain(7);
        let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_named(&named);
        let started = std::time::Instant::now();
        let err = compiler.compile(&ConditionSource::from("@a0")).unwrap_err();
        assert_eq!(err, ConfigError::TooManyNodes { limit: 10_000 });
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn shared_references_resolve_once() {
        let named = fan_out_chain(2);
        let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_named(&named);
        let condition = compiler.compile(&ConditionSource::from("@a0")).unwrap();
        // 10 x 10 comparisons, each a compare node plus two operands.
        assert_eq!(condition.indicator_ids(), BTreeSet::from(["rsi".to_string()]));
        assert_eq!(compiler.resolved.len(), 3);
        assert_eq!(compiler.resolved["a2"].nodes, 3);
        assert_eq!(compiler.resolved["a0"].nodes, 1 + 10 * (1 + 10 * 3));
    }

    #[test]
    fn reference_depth_counts_from_the_use_site() {
        // Compare at depth 11, its operands at 12.
        let deep = format!("{}rsi > 1", "not ".repeat(10));
        let named = BTreeMap::from([("deep".to_string(), ConditionSource::from(deep.as_str()))]);
        let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_named(&named);
        assert!(compiler.compile(&ConditionSource::from("@deep")).is_ok());

        let mut wrapped = ConditionSource::from("@deep");
        for _ in 0..8 {
            wrapped = ConditionSource::Node(ConditionNode::Not(Box::new(wrapped)));
        }
        assert!(matches!(
            compiler.compile(&wrapped),
            Err(ConfigError::DepthExceeded { limit: 16, .. })
        ));
    }
}
