//! Fill pricing and cash accounting.
//!
//! Futures PnL on a linear contract: `(exit - entry) × size × sign`. Fees are
//! charged on the notional of every fill; slippage moves each fill price
//! against the trader by `slippage_bps`.

use crate::config::ExecutionConfig;
use crate::domain::Side;

/// Whether a fill buys or sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDirection {
    Buy,
    Sell,
}

impl FillDirection {
    pub fn entering(side: Side) -> Self {
        match side {
            Side::Long => FillDirection::Buy,
            Side::Short => FillDirection::Sell,
        }
    }

    pub fn exiting(side: Side) -> Self {
        match side {
            Side::Long => FillDirection::Sell,
            Side::Short => FillDirection::Buy,
        }
    }
}

/// Reference price adjusted adversely by slippage.
pub fn slipped_price(reference: f64, direction: FillDirection, slippage_bps: f64) -> f64 {
    let adj = slippage_bps / 10_000.0;
    match direction {
        FillDirection::Buy => reference * (1.0 + adj),
        FillDirection::Sell => reference * (1.0 - adj),
    }
}

/// One priced fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricedFill {
    pub price: f64,
    pub fee: f64,
    /// `|price - reference| × size`.
    pub slippage_cost: f64,
}

pub fn price_fill(
    reference: f64,
    size: f64,
    direction: FillDirection,
    execution: &ExecutionConfig,
) -> PricedFill {
    let price = slipped_price(reference, direction, execution.slippage_bps);
    PricedFill {
        price,
        fee: price * size * execution.fee_rate,
        slippage_cost: (price - reference).abs() * size,
    }
}

/// Contract size for a new position: `cash × position_size / price`.
pub fn position_size(cash: f64, fraction: f64, price: f64) -> f64 {
    if price <= 0.0 || cash <= 0.0 {
        return 0.0;
    }
    cash * fraction / price
}

pub fn gross_pnl(side: Side, entry: f64, exit: f64, size: f64) -> f64 {
    (exit - entry) * size * side.sign()
}
