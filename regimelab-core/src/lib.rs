//! RegimeLab Core: condition language, regime classification, routing and
//! the bar-close simulation loop for crypto futures.
//!
//! This crate contains the decision engine:
//! - Domain types (bars, trades, timeframes, hashes)
//! - Condition language: parser, compiler with load-time validation, evaluator
//! - Regime classifier and the confirmation/cooldown stability tracker
//! - Strategy router over stabilized regime sets
//! - Per-symbol simulation step with stop ratchet and cost model
//! - Deterministic backtest driver, metrics and run fingerprints
//!
//! Indicators are computed elsewhere; the engine only consumes snapshots.

pub mod condition;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod regime;
pub mod result;
pub mod router;
pub mod snapshot;

pub use config::{CompiledConfig, PlatformConfig};
pub use engine::{run_backtest, BacktestInput, CancelToken, SymbolEngine};
pub use error::{ConfigError, DataError, EngineError, FeedError, InvariantViolation};
pub use result::BacktestResult;
