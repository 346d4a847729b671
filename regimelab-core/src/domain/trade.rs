//! Trade: one position lifecycle from entry signal to exit fill.

use super::ids::TradeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// True if `candidate` is at least as protective as `current` for this side.
    pub fn is_tighter_or_equal(self, candidate: f64, current: f64) -> bool {
        match self {
            Side::Long => candidate >= current,
            Side::Short => candidate <= current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    /// Entry decided, waiting for the next bar's open.
    Pending,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The pinned strategy's exit condition fired.
    ExitSignal,
    StopLoss,
    TakeProfit,
    /// The routing rule stopped matching, or an exit-scope regime committed.
    RegimeExit,
    /// Data ran out with the position still open.
    EndOfData,
}

/// An accepted stop level, recorded each time the authoritative stop changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopUpdate {
    pub bar_index: usize,
    pub price: f64,
}

/// A trade record.
///
/// While `Pending`, the entry fields hold the signal bar and its close as a
/// reference; they are replaced by the actual fill when the trade opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    // ── Identification ──
    pub id: TradeId,
    pub symbol: String,
    pub side: Side,
    pub strategy_id: String,
    pub strategy_set_id: String,
    /// Index of the routing rule (in priority order) that selected the set.
    pub routing_rule: usize,
    pub state: TradeState,

    // ── Entry ──
    pub signal_bar: usize,
    pub signal_time: DateTime<Utc>,
    pub entry_bar: usize,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,

    // ── Risk ──
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub stop_history: Vec<StopUpdate>,
    /// Best price seen since entry (highest for longs, lowest for shorts).
    pub extreme_price: f64,
    pub trailing_active: bool,

    // ── Size & costs ──
    pub size: f64,
    pub fees_accrued: f64,
    pub slippage_cost: f64,

    // ── Exit ──
    pub exit_bar: Option<usize>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,

    // ── PnL ──
    pub gross_pnl: f64,
    pub net_pnl: f64,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.state == TradeState::Open
    }

    /// Mark-to-market PnL at `price`, before fees.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if self.state != TradeState::Open {
            return 0.0;
        }
        (price - self.entry_price) * self.size * self.side.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }

    /// Return on the trade as a fraction of entry notional.
    pub fn return_pct(&self) -> f64 {
        let notional = self.notional();
        if notional == 0.0 {
            return 0.0;
        }
        self.net_pnl / notional
    }

    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn bars_held(&self) -> usize {
        self.exit_bar
            .map(|exit| exit.saturating_sub(self.entry_bar))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_trade() -> Trade {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        Trade {
            id: TradeId(1),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            strategy_id: "rsi_breakout".into(),
            strategy_set_id: "trend".into(),
            routing_rule: 0,
            state: TradeState::Closed,
            signal_bar: 4,
            signal_time: t,
            entry_bar: 4,
            entry_time: t,
            entry_price: 100.0,
            stop_price: Some(95.0),
            take_profit_price: None,
            stop_history: vec![StopUpdate { bar_index: 4, price: 95.0 }],
            extreme_price: 112.0,
            trailing_active: false,
            size: 50.0,
            fees_accrued: 10.0,
            slippage_cost: 5.0,
            exit_bar: Some(8),
            exit_time: Some(t),
            exit_price: Some(110.0),
            exit_reason: Some(ExitReason::ExitSignal),
            gross_pnl: 500.0,
            net_pnl: 490.0,
        }
    }

    #[test]
    fn return_pct_calculation() {
        let trade = sample_trade();
        assert!((trade.return_pct() - 490.0 / 5000.0).abs() < 1e-10);
        assert!(trade.is_winner());
        assert_eq!(trade.bars_held(), 4);
    }

    #[test]
    fn unrealized_pnl_short() {
        let mut trade = sample_trade();
        trade.state = TradeState::Open;
        trade.side = Side::Short;
        assert!((trade.unrealized_pnl(90.0) - 500.0).abs() < 1e-10);
    }

    #[test]
    fn closed_trade_has_no_unrealized_pnl() {
        assert_eq!(sample_trade().unrealized_pnl(200.0), 0.0);
    }

    #[test]
    fn tighter_stop_by_side() {
        assert!(Side::Long.is_tighter_or_equal(96.0, 95.0));
        assert!(!Side::Long.is_tighter_or_equal(94.0, 95.0));
        assert!(Side::Short.is_tighter_or_equal(104.0, 105.0));
        assert!(!Side::Short.is_tighter_or_equal(106.0, 105.0));
    }

    #[test]
    fn trade_serialization_roundtrip() {
        let trade = sample_trade();
        let json = serde_json::to_string(&trade).unwrap();
        let deser: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(trade, deser);
    }
}
