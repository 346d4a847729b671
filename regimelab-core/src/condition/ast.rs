//! Compiled condition tree.
//!
//! Produced once at load by [`super::compile`]; evaluation dispatches on these
//! enums only, never on strings.

use super::functions::Builtin;
use std::collections::BTreeSet;
use std::fmt;

/// Comparison operators. `Eq` / `Ne` compare within an absolute epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    /// Accepts both the word form (`gt`) and the symbol form (`>`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gt" | ">" => Some(CompareOp::Gt),
            "lt" | "<" => Some(CompareOp::Lt),
            "ge" | ">=" => Some(CompareOp::Ge),
            "le" | "<=" => Some(CompareOp::Le),
            "eq" | "==" => Some(CompareOp::Eq),
            "ne" | "!=" => Some(CompareOp::Ne),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLogic {
    All,
    Any,
    /// True iff no child is true.
    None,
}

/// `id` or `id.field` in the current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRef {
    pub id: String,
    pub field: Option<String>,
}

impl IndicatorRef {
    /// Split `macd.signal` into id and field.
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('.') {
            Some((id, field)) => Self {
                id: id.to_string(),
                field: Some(field.to_string()),
            },
            None => Self {
                id: reference.to_string(),
                field: None,
            },
        }
    }
}

impl fmt::Display for IndicatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.id, field),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A numeric operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(f64),
    /// Literal series `[oldest, …, now]`; the last element is the current bar.
    Series(Vec<f64>),
    Indicator(IndicatorRef),
    Call(Box<FunctionCall>),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{v}"),
            Operand::Series(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Operand::Indicator(r) => write!(f, "{r}"),
            Operand::Call(call) => write!(f, "{call}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: Builtin,
    pub args: Vec<Operand>,
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function.name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Binary { op: CompareOp, right: Operand },
    /// Inclusive on both ends.
    Between { low: Operand, high: Operand },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub test: Test,
}

/// A boolean condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare(Comparison),
    Group {
        logic: GroupLogic,
        children: Vec<Condition>,
    },
    /// A boolean builtin such as `crossover` or `is_null`.
    Call(FunctionCall),
}

impl Condition {
    /// Every indicator id the condition reads.
    pub fn indicator_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.visit_operands(&mut |op| {
            if let Operand::Indicator(r) = op {
                ids.insert(r.id.clone());
            }
        });
        ids
    }

    /// Number of snapshots (current included) evaluation may look at.
    pub fn lookback(&self) -> usize {
        match self {
            Condition::Compare(c) => {
                let right = match &c.test {
                    Test::Binary { right, .. } => right.lookback(),
                    Test::Between { low, high } => low.lookback().max(high.lookback()),
                };
                c.left.lookback().max(right)
            }
            Condition::Group { children, .. } => {
                children.iter().map(Condition::lookback).max().unwrap_or(1)
            }
            Condition::Call(call) => call.lookback(),
        }
    }

    /// Rename indicator ids in place; ids absent from `aliases` are kept.
    pub fn remap_indicators(&mut self, aliases: &std::collections::BTreeMap<String, String>) {
        self.visit_operands_mut(&mut |op| {
            if let Operand::Indicator(r) = op {
                if let Some(target) = aliases.get(&r.id) {
                    r.id = target.clone();
                }
            }
        });
    }

    fn visit_operands(&self, f: &mut dyn FnMut(&Operand)) {
        match self {
            Condition::Compare(c) => {
                c.left.visit(f);
                match &c.test {
                    Test::Binary { right, .. } => right.visit(f),
                    Test::Between { low, high } => {
                        low.visit(f);
                        high.visit(f);
                    }
                }
            }
            Condition::Group { children, .. } => {
                for child in children {
                    child.visit_operands(f);
                }
            }
            Condition::Call(call) => {
                for arg in &call.args {
                    arg.visit(f);
                }
            }
        }
    }

    fn visit_operands_mut(&mut self, f: &mut dyn FnMut(&mut Operand)) {
        match self {
            Condition::Compare(c) => {
                c.left.visit_mut(f);
                match &mut c.test {
                    Test::Binary { right, .. } => right.visit_mut(f),
                    Test::Between { low, high } => {
                        low.visit_mut(f);
                        high.visit_mut(f);
                    }
                }
            }
            Condition::Group { children, .. } => {
                for child in children {
                    child.visit_operands_mut(f);
                }
            }
            Condition::Call(call) => {
                for arg in &mut call.args {
                    arg.visit_mut(f);
                }
            }
        }
    }
}

impl Operand {
    pub fn lookback(&self) -> usize {
        match self {
            Operand::Literal(_) | Operand::Series(_) | Operand::Indicator(_) => 1,
            Operand::Call(call) => call.lookback(),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&Operand)) {
        f(self);
        if let Operand::Call(call) = self {
            for arg in &call.args {
                arg.visit(f);
            }
        }
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Operand)) {
        f(self);
        if let Operand::Call(call) = self {
            for arg in &mut call.args {
                arg.visit_mut(f);
            }
        }
    }
}

impl FunctionCall {
    pub fn lookback(&self) -> usize {
        let args = self.args.iter().map(Operand::lookback).max().unwrap_or(1);
        match self.function {
            Builtin::Percentile => {
                let window = match self.args.get(1) {
                    Some(Operand::Literal(w)) => *w as usize,
                    _ => 1,
                };
                let source = self.args.first().map(Operand::lookback).unwrap_or(1);
                window + source - 1
            }
            Builtin::Crossover => args + 1,
            Builtin::IsNull | Builtin::Coalesce | Builtin::FirstNonNull => args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ind(id: &str) -> Operand {
        Operand::Indicator(IndicatorRef::parse(id))
    }

    #[test]
    fn indicator_ref_splits_field() {
        let r = IndicatorRef::parse("macd.signal");
        assert_eq!(r.id, "macd");
        assert_eq!(r.field.as_deref(), Some("signal"));
        assert_eq!(r.to_string(), "macd.signal");
    }

    #[test]
    fn lookback_accounts_for_nested_windows() {
        let pct = Operand::Call(Box::new(FunctionCall {
            function: Builtin::Percentile,
            args: vec![ind("atr"), Operand::Literal(20.0), Operand::Literal(50.0)],
        }));
        let cross = Condition::Call(FunctionCall {
            function: Builtin::Crossover,
            args: vec![ind("atr"), pct],
        });
        assert_eq!(cross.lookback(), 21);
    }

    #[test]
    fn remap_renames_only_aliased_ids() {
        let mut cond = Condition::Compare(Comparison {
            left: ind("rsi"),
            test: Test::Between {
                low: ind("band.lower"),
                high: Operand::Literal(80.0),
            },
        });
        let aliases = BTreeMap::from([("rsi".to_string(), "rsi_fast".to_string())]);
        cond.remap_indicators(&aliases);
        let ids: Vec<String> = cond.indicator_ids().into_iter().collect();
        assert_eq!(ids, vec!["band".to_string(), "rsi_fast".to_string()]);
    }

    #[test]
    fn operand_display_is_readable() {
        let call = Operand::Call(Box::new(FunctionCall {
            function: Builtin::Coalesce,
            args: vec![ind("adx"), Operand::Literal(20.0)],
        }));
        assert_eq!(call.to_string(), "coalesce(adx, 20)");
        assert_eq!(Operand::Series(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
    }
}
