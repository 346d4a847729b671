//! Domain types for RegimeLab

pub mod bar;
pub mod ids;
pub mod timeframe;
pub mod trade;

pub use bar::Bar;
pub use ids::{ConfigHash, DatasetHash, ResultHash, TradeId};
pub use timeframe::Timeframe;
pub use trade::{ExitReason, Side, StopUpdate, Trade, TradeState};

/// Symbol type alias
pub type Symbol = String;

/// Regime identifier as declared in configuration.
pub type RegimeId = String;
