//! Per-symbol mutable engine state and the records a step emits.

use super::ratchet::StopRatchet;
use crate::config::CompiledConfig;
use crate::domain::{ExitReason, Side, Trade, TradeId};
use crate::error::DataError;
use crate::regime::{ActiveRegimeSet, StableRegimeState};
use crate::snapshot::SnapshotHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which tracker committed a regime change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerScope {
    /// Entry-scope regimes, tracked every bar.
    Entry,
    /// Exit and in-trade regimes, tracked only while a position is open.
    Position,
}

/// One committed regime change, as appended to the regime history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeChange {
    pub bar_index: usize,
    pub time: DateTime<Utc>,
    pub scope: TrackerScope,
    pub from: ActiveRegimeSet,
    pub to: ActiveRegimeSet,
}

/// Mark-to-market equity at a bar's close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub bar_index: usize,
    pub time: DateTime<Utc>,
    pub cash: f64,
    pub equity: f64,
}

/// Trade lifecycle events, in the order they happened within the bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    /// An entry condition fired at the close.
    EntrySignal {
        trade: TradeId,
        strategy_id: String,
        side: Side,
        reference_price: f64,
    },
    Opened {
        trade: TradeId,
        price: f64,
        size: f64,
        stop: Option<f64>,
        take_profit: Option<f64>,
    },
    /// The authoritative stop tightened.
    StopMoved { trade: TradeId, from: Option<f64>, to: f64 },
    /// An exit was decided at the close.
    ExitSignal { trade: TradeId, reason: ExitReason },
    Closed {
        trade: TradeId,
        price: f64,
        reason: ExitReason,
        net_pnl: f64,
    },
    /// A pending entry could not be filled (no equity left to size it).
    EntryCancelled { trade: TradeId },
}

/// Counters for decisions that did not happen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Entry decisions skipped because an operand was unavailable.
    pub skipped_entry_decisions: usize,
    /// Bars whose entry-scope classification failed while flat; the tracker held.
    pub skipped_classifications: usize,
    /// Skips keyed by the unavailable operand.
    pub skipped_by_reference: BTreeMap<String, usize>,
    /// Bars where no routing rule matched while flat.
    pub routing_misses: usize,
    /// Trailing candidates rejected because they would loosen the stop.
    pub rejected_stop_updates: usize,
    pub cancelled_entries: usize,
}

impl Diagnostics {
    pub(crate) fn record_skip(&mut self, error: &DataError) {
        let DataError::Unavailable { reference } = error;
        *self.skipped_by_reference.entry(reference.clone()).or_default() += 1;
    }
}

/// Indices pinning an open trade to the strategy that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRoute {
    pub set_index: usize,
    pub strategy_index: usize,
    /// Position in the priority-ordered rule list.
    pub rule_index: usize,
}

/// Mutable state that evolves bar-by-bar for one symbol.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub cash: f64,
    /// Index of the next bar to process.
    pub bar_index: usize,
    pub next_trade_id: u64,
    /// The single pending or open trade, if any.
    pub trade: Option<Trade>,
    pub route: Option<OpenRoute>,
    pub ratchet: Option<StopRatchet>,
    /// Exit decided at the previous close, filled at this bar's open.
    pub pending_exit: Option<ExitReason>,
    pub entry_tracker: StableRegimeState,
    /// Present only while a position is open; reset at every entry.
    pub position_tracker: Option<StableRegimeState>,
    pub history: SnapshotHistory,
    pub last_close_time: Option<DateTime<Utc>>,
    pub last_close: Option<f64>,
}

impl EngineState {
    pub fn new(config: &CompiledConfig) -> Self {
        Self {
            cash: config.execution.initial_capital,
            bar_index: 0,
            next_trade_id: 1,
            trade: None,
            route: None,
            ratchet: None,
            pending_exit: None,
            entry_tracker: StableRegimeState::new(&config.stability),
            position_tracker: None,
            history: SnapshotHistory::new(config.history_capacity),
            last_close_time: None,
            last_close: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.trade.is_none()
    }

    pub fn open_trade(&self) -> Option<&Trade> {
        self.trade.as_ref().filter(|t| t.is_open())
    }

    /// Cash plus unrealized PnL of the open position at `price`.
    pub fn equity_at(&self, price: f64) -> f64 {
        self.cash + self.trade.as_ref().map_or(0.0, |t| t.unrealized_pnl(price))
    }

    pub(crate) fn allocate_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        id
    }
}
