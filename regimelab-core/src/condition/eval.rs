//! Condition evaluation against the current snapshot and its look-back window.
//!
//! Evaluation is total over well-typed trees: the only failure is a
//! [`DataError`] when a comparison or crossover receives a missing value.
//! Recursion depth is bounded by the compile-time depth limit.

use super::ast::{CompareOp, Comparison, Condition, FunctionCall, GroupLogic, Operand, Test};
use super::functions::{percentile, Builtin};
use crate::error::DataError;
use crate::snapshot::SnapshotHistory;

/// Absolute tolerance for `eq` / `ne`.
pub const EPSILON: f64 = 1e-9;

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    /// Missing or NaN.
    Null,
}

/// One operand sampled at a given lag.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sample {
    Number(f64),
    Null,
    /// The lag reaches before the first bar.
    BeforeStart,
}

impl Sample {
    fn number(self) -> Option<f64> {
        match self {
            Sample::Number(v) => Some(v),
            Sample::Null | Sample::BeforeStart => None,
        }
    }
}

/// Evaluate a boolean condition on the latest snapshot in `history`.
pub fn evaluate(condition: &Condition, history: &SnapshotHistory) -> Result<bool, DataError> {
    match condition {
        Condition::Compare(comparison) => compare(comparison, history),
        Condition::Group { logic, children } => match logic {
            GroupLogic::All => {
                for child in children {
                    if !evaluate(child, history)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            GroupLogic::Any => {
                for child in children {
                    if evaluate(child, history)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            GroupLogic::None => {
                for child in children {
                    if evaluate(child, history)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        },
        Condition::Call(call) => call_bool(call, history),
    }
}

/// Evaluate a numeric operand on the latest snapshot. Never fails: missing data is `Null`.
pub fn evaluate_operand(operand: &Operand, history: &SnapshotHistory) -> Value {
    match sample(operand, history, 0) {
        Sample::Number(v) => Value::Number(v),
        Sample::Null | Sample::BeforeStart => Value::Null,
    }
}

fn compare(comparison: &Comparison, history: &SnapshotHistory) -> Result<bool, DataError> {
    let left = required(&comparison.left, history)?;
    match &comparison.test {
        Test::Binary { op, right } => {
            let right = required(right, history)?;
            Ok(apply(*op, left, right))
        }
        Test::Between { low, high } => {
            let low = required(low, history)?;
            let high = required(high, history)?;
            Ok(left >= low && left <= high)
        }
    }
}

fn apply(op: CompareOp, left: f64, right: f64) -> bool {
    match op {
        CompareOp::Gt => left > right,
        CompareOp::Lt => left < right,
        CompareOp::Ge => left >= right,
        CompareOp::Le => left <= right,
        CompareOp::Eq => (left - right).abs() <= EPSILON,
        CompareOp::Ne => (left - right).abs() > EPSILON,
    }
}

fn required(operand: &Operand, history: &SnapshotHistory) -> Result<f64, DataError> {
    sample(operand, history, 0).number().ok_or_else(|| unavailable(operand))
}

fn unavailable(operand: &Operand) -> DataError {
    DataError::Unavailable {
        reference: operand.to_string(),
    }
}

fn call_bool(call: &FunctionCall, history: &SnapshotHistory) -> Result<bool, DataError> {
    match call.function {
        Builtin::Crossover => {
            let (a, b) = (&call.args[0], &call.args[1]);
            let (prev_a, prev_b) = (sample(a, history, 1), sample(b, history, 1));
            if prev_a == Sample::BeforeStart || prev_b == Sample::BeforeStart {
                return Ok(false);
            }
            let now_a = required(a, history)?;
            let now_b = required(b, history)?;
            let prev_a = prev_a.number().ok_or_else(|| unavailable(a))?;
            let prev_b = prev_b.number().ok_or_else(|| unavailable(b))?;
            Ok(prev_a <= prev_b && now_a > now_b)
        }
        Builtin::IsNull => Ok(sample(&call.args[0], history, 0).number().is_none()),
        // Numeric builtins are rejected in boolean position at compile time.
        Builtin::Percentile | Builtin::Coalesce | Builtin::FirstNonNull => Ok(false),
    }
}

fn sample(operand: &Operand, history: &SnapshotHistory, lag: usize) -> Sample {
    match operand {
        Operand::Literal(v) => Sample::Number(*v),
        Operand::Series(values) => {
            if lag >= values.len() {
                Sample::BeforeStart
            } else {
                Sample::Number(values[values.len() - 1 - lag])
            }
        }
        Operand::Indicator(r) => match history.at(lag) {
            None => Sample::BeforeStart,
            Some(snapshot) => snapshot
                .resolve(&r.id, r.field.as_deref())
                .map_or(Sample::Null, Sample::Number),
        },
        Operand::Call(call) => sample_call(call, history, lag),
    }
}

fn sample_call(call: &FunctionCall, history: &SnapshotHistory, lag: usize) -> Sample {
    match call.function {
        Builtin::Percentile => {
            let window = match call.args[1] {
                Operand::Literal(w) => w as usize,
                _ => return Sample::Null,
            };
            let pct = match call.args[2] {
                Operand::Literal(p) => p,
                _ => return Sample::Null,
            };
            let mut values = Vec::with_capacity(window);
            for offset in 0..window {
                match sample(&call.args[0], history, lag + offset) {
                    Sample::Number(v) => values.push(v),
                    Sample::Null | Sample::BeforeStart => return Sample::Null,
                }
            }
            values.sort_by(f64::total_cmp);
            Sample::Number(percentile(&values, pct))
        }
        Builtin::Coalesce | Builtin::FirstNonNull => {
            let mut saw_bar = false;
            for arg in &call.args {
                match sample(arg, history, lag) {
                    Sample::Number(v) => return Sample::Number(v),
                    Sample::Null => saw_bar = true,
                    Sample::BeforeStart => {}
                }
            }
            if saw_bar {
                Sample::Null
            } else {
                Sample::BeforeStart
            }
        }
        Builtin::Crossover | Builtin::IsNull => Sample::Null,
    }
}
