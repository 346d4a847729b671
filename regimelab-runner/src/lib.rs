//! RegimeLab Runner: config loading, parameter sweeps and live sessions.
//!
//! This crate builds on `regimelab-core` to provide:
//! - TOML/JSON configuration loading with load-time validation
//! - JSON dataset loading for backtests
//! - Parallel parameter sweeps over stability and risk settings
//! - Per-symbol live/paper session coordination with order intents and
//!   regime-change notifications

pub mod config;
pub mod error;
pub mod live;
pub mod sweep;

pub use config::{compile_config, load_compiled, load_config, load_input, parse_config, ConfigFormat};
pub use error::RunnerError;
pub use live::{
    ExecutionAdapter, FailedIntent, LiveCoordinator, LiveUpdate, OrderIntent, PaperAdapter,
    RegimeNotice,
};
pub use sweep::{CandidateResult, GridAxis, ParamGrid, ParamSweep, SweepCandidate, SweepReport};
