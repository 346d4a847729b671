//! Condition language: a safe boolean/numeric expression tree over indicator
//! snapshots.
//!
//! Sources (text or structured) are compiled once at load into [`Condition`]
//! trees; per-bar evaluation walks the compiled tree only.

pub mod ast;
pub mod compile;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod source;

pub use ast::{CompareOp, Comparison, Condition, FunctionCall, GroupLogic, IndicatorRef, Operand, Test};
pub use compile::{cache_key, ConditionCache, ConditionCompiler, ConditionLimits};
pub use eval::{evaluate, evaluate_operand, Value, EPSILON};
pub use functions::{Builtin, ValueType};
pub use source::{CallSource, CompareSource, ConditionNode, ConditionSource, OperandSource};

use crate::error::ConfigError;

impl Condition {
    /// Compile a standalone text expression with default limits.
    ///
    /// Indicator ids are not validated and named references are unavailable.
    pub fn parse(text: &str) -> Result<Condition, ConfigError> {
        let compiled = ConditionCompiler::new(ConditionLimits::default())
            .compile(&ConditionSource::from(text))?;
        Ok((*compiled).clone())
    }
}
