//! Serialized condition forms as they appear in configuration files.
//!
//! A condition is either a text expression (`"rsi > 70 and not is_null(adx)"`)
//! or a structured node (`{"all": [...]}`). Both decode to the same
//! [`ConditionNode`] tree before compilation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSource {
    Text(String),
    Node(ConditionNode),
}

impl From<&str> for ConditionSource {
    fn from(text: &str) -> Self {
        ConditionSource::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ConditionNode {
    All(Vec<ConditionSource>),
    Any(Vec<ConditionSource>),
    None(Vec<ConditionSource>),
    /// Sugar for `none: [x]`.
    Not(Box<ConditionSource>),
    Compare(CompareSource),
    Call(CallSource),
    /// Reference to a named condition, inlined at load.
    Ref(String),
}

/// `{"left": "rsi", "op": ">", "right": 70}` or
/// `{"left": "rsi", "op": "between", "low": 30, "high": 70}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareSource {
    pub left: OperandSource,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<OperandSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<OperandSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<OperandSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSource {
    pub name: String,
    #[serde(default)]
    pub args: Vec<OperandSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperandSource {
    Number(f64),
    Series(Vec<f64>),
    /// `id` or `id.field`.
    Reference(String),
    Call { call: CallSource },
}
