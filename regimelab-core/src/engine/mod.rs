//! Simulation engine: the per-symbol bar step and the backtest driver.
//!
//! One [`SymbolEngine`] per symbol owns all mutable state (trackers, trade,
//! stop ratchet, look-back window). Backtests drive it from a slice of bars;
//! live sessions drive it one closed bar at a time. Both go through the same
//! [`SymbolEngine::step`], so a replay reproduces a backtest exactly.

pub mod accounting;
pub mod cancel;
pub mod loop_runner;
pub mod ratchet;
pub mod state;
pub mod step;

pub use accounting::{gross_pnl, position_size, price_fill, FillDirection, PricedFill};
pub use cancel::CancelToken;
pub use loop_runner::{run_backtest, BacktestInput};
pub use ratchet::{enforce_ratchet, StopProposal, StopRatchet};
pub use state::{
    Diagnostics, EngineState, EquityPoint, OpenRoute, RegimeChange, TrackerScope, TradeEvent,
};
pub use step::{StepOutcome, SymbolEngine};
