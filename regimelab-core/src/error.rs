//! Error taxonomy: load-time config errors, per-bar data errors, feed errors,
//! invariant violations, and the engine error that wraps them with bar context.

use crate::domain::{Timeframe, TradeId};
use chrono::{DateTime, Utc};

/// Malformed configuration. Always raised at load, never while a run is in progress.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("unknown comparison operator '{op}'")]
    UnknownOperator { op: String },

    #[error("function '{function}' expects {expected} argument(s), found {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("condition nesting depth {depth} exceeds limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    #[error("condition group width {width} exceeds limit {limit}")]
    WidthExceeded { width: usize, limit: usize },

    #[error("condition expands to more than {limit} nodes once references are inlined")]
    TooManyNodes { limit: usize },

    #[error("cyclic reference: {}", .chain.join(" -> "))]
    CyclicReference { chain: Vec<String> },

    #[error("unknown {kind} '{id}' referenced by {context}")]
    UnknownReference {
        kind: &'static str,
        id: String,
        context: String,
    },

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("invalid parameter in {context}: {reason}")]
    InvalidParameter { context: String, reason: String },
}

impl ConfigError {
    /// Render a syntax error with a caret under the offending character.
    ///
    /// Other variants render as their plain message.
    pub fn display_with_context(&self, input: &str) -> String {
        match self {
            ConfigError::Syntax { position, .. } => {
                let caret = " ".repeat(*position) + "^";
                format!("{input}\n{caret}\n{self}")
            }
            _ => self.to_string(),
        }
    }

    /// Prefix the error's context with the owning definition, e.g. `regime 'trend'`.
    pub(crate) fn within(self, owner: &str) -> Self {
        match self {
            ConfigError::TypeMismatch {
                context,
                expected,
                found,
            } => ConfigError::TypeMismatch {
                context: format!("{owner}: {context}"),
                expected,
                found,
            },
            ConfigError::UnknownReference { kind, id, context } => ConfigError::UnknownReference {
                kind,
                id,
                context: format!("{owner}: {context}"),
            },
            ConfigError::InvalidParameter { context, reason } => ConfigError::InvalidParameter {
                context: format!("{owner}: {context}"),
                reason,
            },
            other => other,
        }
    }
}

/// An indicator value needed by a decision is missing or NaN on this bar.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("value unavailable for {reference}")]
    Unavailable { reference: String },
}

/// Input data that cannot be simulated. Detected before the first bar runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("no bars supplied")]
    Empty,

    #[error("bar {index} closes at {close_time}, not after the previous bar")]
    OutOfOrder {
        index: usize,
        close_time: DateTime<Utc>,
    },

    #[error("bar {index} fails OHLC sanity checks")]
    InvalidBar { index: usize },

    #[error("{snapshots} base snapshots supplied for {bars} bars")]
    SnapshotCount { bars: usize, snapshots: usize },

    #[error("{timeframe} feed is out of order at index {index}")]
    HigherTimeframeOutOfOrder { timeframe: Timeframe, index: usize },

    #[error("{timeframe} feed is not coarser than the {base} base timeframe")]
    NotHigherTimeframe { timeframe: Timeframe, base: Timeframe },

    #[error("indicator '{id}' is supplied by more than one feed")]
    DuplicateIndicator { id: String },
}

/// A broken engine invariant. Always fatal: indicates a defect, never corrected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("second open trade for {symbol} while {existing} is open")]
    DoubleOpen { symbol: String, existing: TradeId },

    #[error("stop for {trade} loosened from {previous} to {proposed}")]
    StopLoosened {
        trade: TradeId,
        previous: f64,
        proposed: f64,
    },
}

/// Errors that abort a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("{symbol} bar {bar_index} ({timestamp}): {source} while a position is open")]
    Data {
        symbol: String,
        bar_index: usize,
        timestamp: DateTime<Utc>,
        source: DataError,
    },

    #[error("{symbol} bar {bar_index} ({timestamp}): invariant violated: {violation}")]
    Invariant {
        symbol: String,
        bar_index: usize,
        timestamp: DateTime<Utc>,
        #[source]
        violation: InvariantViolation,
    },

    #[error("run cancelled at bar {bar_index}")]
    Cancelled { bar_index: usize },
}
