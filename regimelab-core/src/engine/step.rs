//! The per-bar step shared by backtests and live sessions.
//!
//! Fixed order on every bar:
//! 0. Start of bar: fill a pending entry or exit at the open, then check the
//!    open position's stop and target against the bar's range (stop wins when
//!    both are touched; gaps fill at the open).
//! 1. Push the merged snapshot onto the look-back window.
//! 2. Classify and stabilize entry-scope regimes; while a position is open,
//!    also exit/in-trade regimes on a tracker reset at entry.
//! 3. Flat: route and evaluate the selected set's entry conditions in order.
//! 4. Open: regime exit, the pinned strategy's exit condition, then the
//!    trailing-stop update (loosening candidates are rejected).
//! 5. Mark to market at the close.

use super::accounting::{gross_pnl, position_size, price_fill, FillDirection};
use super::ratchet::{enforce_ratchet, StopProposal, StopRatchet};
use super::state::{
    Diagnostics, EngineState, EquityPoint, OpenRoute, RegimeChange, TrackerScope, TradeEvent,
};
use crate::condition::evaluate;
use crate::config::{
    CompiledConfig, CompiledStrategy, FillModel, RegimeScope, RiskConfig, TrailingMode,
};
use crate::domain::{Bar, ExitReason, Side, StopUpdate, Trade, TradeState};
use crate::error::{DataError, EngineError, FeedError, InvariantViolation};
use crate::regime::{classify, classify_scopes, ActiveRegimeSet, RegimeTransition, StableRegimeState};
use crate::router::{route, Route};
use crate::snapshot::IndicatorSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one bar produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub bar_index: usize,
    pub time: DateTime<Utc>,
    /// Committed entry-scope regime set after this bar.
    pub active_regimes: ActiveRegimeSet,
    /// Strategy set the router selects for the committed regimes, if any.
    pub active_strategy_set: Option<String>,
    pub transitions: Vec<RegimeChange>,
    pub events: Vec<TradeEvent>,
    pub closed: Vec<Trade>,
    pub equity: EquityPoint,
}

/// Single-threaded simulation state for one symbol.
///
/// Owns its regime trackers and trade state; nothing is shared between
/// engines except the read-only compiled configuration.
#[derive(Debug, Clone)]
pub struct SymbolEngine {
    symbol: String,
    config: Arc<CompiledConfig>,
    state: EngineState,
    diagnostics: Diagnostics,
}

impl SymbolEngine {
    pub fn new(symbol: impl Into<String>, config: Arc<CompiledConfig>) -> Self {
        let state = EngineState::new(&config);
        Self {
            symbol: symbol.into(),
            config,
            state,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn config(&self) -> &Arc<CompiledConfig> {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Process one closed bar with its merged indicator snapshot.
    pub fn step(&mut self, bar: &Bar, snapshot: IndicatorSnapshot) -> Result<StepOutcome, EngineError> {
        let config = Arc::clone(&self.config);
        let t = self.state.bar_index;
        self.check_bar(bar)?;

        let mut transitions = Vec::new();
        let mut events = Vec::new();
        let mut closed = Vec::new();

        // ─── Phase 0: start of bar ───
        self.start_of_bar(bar, &config, &mut events, &mut closed);

        // ─── Snapshot ───
        self.state.history.push(snapshot);

        // ─── Regimes ───
        let position_open = self.state.open_trade().is_some();
        match classify(&config.regimes, &self.state.history, RegimeScope::Entry) {
            Ok(observed) => {
                if let Some(change) = self.state.entry_tracker.update(observed, &config.stability) {
                    transitions.push(self.regime_change(bar, TrackerScope::Entry, change));
                }
            }
            Err(e) if position_open => return Err(data_error(&self.symbol, t, bar, e)),
            Err(e) => {
                self.diagnostics.skipped_classifications += 1;
                warn!(symbol = %self.symbol, bar_index = t, error = %e, "entry regimes unavailable; tracker held");
            }
        }

        let mut exit_reason = None;
        if position_open && (config.has_scope(RegimeScope::Exit) || config.has_scope(RegimeScope::InTrade)) {
            let observed = classify_scopes(
                &config.regimes,
                &self.state.history,
                &[RegimeScope::Exit, RegimeScope::InTrade],
            )
            .map_err(|e| data_error(&self.symbol, t, bar, e))?;
            let tracker = self
                .state
                .position_tracker
                .get_or_insert_with(|| StableRegimeState::new(&config.stability));
            if let Some(change) = tracker.update(observed, &config.stability) {
                let exits = change.to.ids().iter().any(|id| {
                    config
                        .regimes
                        .iter()
                        .any(|r| r.scope == RegimeScope::Exit && &r.id == id)
                });
                if exits {
                    exit_reason = Some(ExitReason::RegimeExit);
                }
                transitions.push(self.regime_change(bar, TrackerScope::Position, change));
            }
        }

        // ─── Decisions ───
        let routed = route(
            self.state.entry_tracker.current(),
            &config.rules,
            &config.strategy_sets,
        );
        let flat = self.state.trade.is_none();
        if flat {
            match routed {
                Some(r) => self.decide_entry(bar, r, &config, &mut events)?,
                None => self.diagnostics.routing_misses += 1,
            }
        } else if position_open {
            self.manage_position(bar, exit_reason, &config, &mut events, &mut closed)?;
        }

        // ─── Mark to market ───
        let equity = EquityPoint {
            bar_index: t,
            time: bar.close_time,
            cash: self.state.cash,
            equity: self.state.equity_at(bar.close),
        };
        self.state.last_close_time = Some(bar.close_time);
        self.state.last_close = Some(bar.close);
        self.state.bar_index += 1;

        Ok(StepOutcome {
            bar_index: t,
            time: bar.close_time,
            active_regimes: self.state.entry_tracker.current().clone(),
            active_strategy_set: routed.map(|r| r.set.id.clone()),
            transitions,
            events,
            closed,
            equity,
        })
    }

    /// Close out at the last processed close. A pending entry is dropped; an
    /// open position closes with its pending exit reason or `EndOfData`.
    pub fn finish(&mut self) -> Option<Trade> {
        let (Some(price), Some(time)) = (self.state.last_close, self.state.last_close_time) else {
            return None;
        };
        let last_bar = self.state.bar_index.saturating_sub(1);
        let config = Arc::clone(&self.config);
        match self.state.trade.as_ref().map(|t| t.state) {
            Some(TradeState::Pending) => {
                self.state.trade = None;
                self.state.route = None;
                self.diagnostics.cancelled_entries += 1;
                None
            }
            Some(TradeState::Open) => {
                let reason = self
                    .state
                    .pending_exit
                    .take()
                    .unwrap_or(ExitReason::EndOfData);
                let mut events = Vec::new();
                self.close_trade(price, reason, last_bar, time, &config, &mut events)
            }
            _ => None,
        }
    }

    fn check_bar(&self, bar: &Bar) -> Result<(), FeedError> {
        let index = self.state.bar_index;
        if !bar.is_sane() {
            return Err(FeedError::InvalidBar { index });
        }
        if self
            .state
            .last_close_time
            .is_some_and(|last| bar.close_time <= last)
        {
            return Err(FeedError::OutOfOrder {
                index,
                close_time: bar.close_time,
            });
        }
        Ok(())
    }

    fn regime_change(&self, bar: &Bar, scope: TrackerScope, change: RegimeTransition) -> RegimeChange {
        debug!(
            symbol = %self.symbol,
            bar_index = self.state.bar_index,
            ?scope,
            from = %change.from,
            to = %change.to,
            "regime committed"
        );
        RegimeChange {
            bar_index: self.state.bar_index,
            time: bar.close_time,
            scope,
            from: change.from,
            to: change.to,
        }
    }

    fn start_of_bar(
        &mut self,
        bar: &Bar,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
        closed: &mut Vec<Trade>,
    ) {
        let t = self.state.bar_index;
        if self
            .state
            .trade
            .as_ref()
            .is_some_and(|trade| trade.state == TradeState::Pending)
        {
            self.fill_entry(bar.open, t, bar.open_time, config, events);
        }

        if let Some(reason) = self.state.pending_exit.take() {
            closed.extend(self.close_trade(bar.open, reason, t, bar.open_time, config, events));
            return;
        }

        let protective = self
            .state
            .open_trade()
            .and_then(|trade| protective_exit(trade, bar));
        if let Some(hit) = protective {
            let time = if hit.at_open { bar.open_time } else { bar.close_time };
            closed.extend(self.close_trade(hit.price, hit.reason, t, time, config, events));
        }
    }

    fn decide_entry(
        &mut self,
        bar: &Bar,
        routed: Route<'_>,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
    ) -> Result<(), EngineError> {
        let t = self.state.bar_index;
        for (strategy_index, strategy) in routed.set.strategies.iter().enumerate() {
            match evaluate(&strategy.entry, &self.state.history) {
                Ok(true) => {
                    let pin = OpenRoute {
                        set_index: routed.rule.target,
                        strategy_index,
                        rule_index: routed.rule_index,
                    };
                    debug!(
                        symbol = %self.symbol,
                        bar_index = t,
                        set = %routed.set.id,
                        strategy = %strategy.id,
                        "entry condition fired"
                    );
                    return self.open_signal(bar, pin, strategy, &routed.set.id, config, events);
                }
                Ok(false) => {}
                Err(e) => {
                    self.diagnostics.skipped_entry_decisions += 1;
                    self.diagnostics.record_skip(&e);
                    warn!(
                        symbol = %self.symbol,
                        bar_index = t,
                        strategy = %strategy.id,
                        error = %e,
                        "entry decision skipped"
                    );
                }
            }
        }
        Ok(())
    }

    fn open_signal(
        &mut self,
        bar: &Bar,
        pin: OpenRoute,
        strategy: &CompiledStrategy,
        set_id: &str,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
    ) -> Result<(), EngineError> {
        let t = self.state.bar_index;
        if let Some(existing) = &self.state.trade {
            return Err(invariant_error(
                &self.symbol,
                t,
                bar,
                InvariantViolation::DoubleOpen {
                    symbol: self.symbol.clone(),
                    existing: existing.id,
                },
            ));
        }
        let id = self.state.allocate_trade_id();
        events.push(TradeEvent::EntrySignal {
            trade: id,
            strategy_id: strategy.id.clone(),
            side: strategy.side,
            reference_price: bar.close,
        });
        self.state.trade = Some(Trade {
            id,
            symbol: self.symbol.clone(),
            side: strategy.side,
            strategy_id: strategy.id.clone(),
            strategy_set_id: set_id.to_string(),
            routing_rule: pin.rule_index,
            state: TradeState::Pending,
            signal_bar: t,
            signal_time: bar.close_time,
            entry_bar: t,
            entry_time: bar.close_time,
            entry_price: bar.close,
            stop_price: None,
            take_profit_price: None,
            stop_history: Vec::new(),
            extreme_price: bar.close,
            trailing_active: false,
            size: 0.0,
            fees_accrued: 0.0,
            slippage_cost: 0.0,
            exit_bar: None,
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            gross_pnl: 0.0,
            net_pnl: 0.0,
        });
        self.state.route = Some(pin);

        if config.execution.fill == FillModel::SameBarClose {
            self.fill_entry(bar.close, t, bar.close_time, config, events);
        }
        Ok(())
    }

    /// Turn the pending trade into an open position at `reference`.
    fn fill_entry(
        &mut self,
        reference: f64,
        bar_index: usize,
        time: DateTime<Utc>,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
    ) {
        let Some(pin) = self.state.route else {
            return;
        };
        let risk = &config.strategy_sets[pin.set_index].strategies[pin.strategy_index].risk;
        let state = &mut self.state;
        let Some(trade) = state.trade.as_mut() else {
            return;
        };

        let size = position_size(state.cash, risk.position_size, reference);
        if size <= 0.0 {
            events.push(TradeEvent::EntryCancelled { trade: trade.id });
            warn!(symbol = %self.symbol, trade = %trade.id, cash = state.cash, "no equity to size entry");
            state.trade = None;
            state.route = None;
            self.diagnostics.cancelled_entries += 1;
            return;
        }

        let fill = price_fill(reference, size, FillDirection::entering(trade.side), &config.execution);
        let (stop, take_profit) = initial_levels(trade.side, fill.price, risk);
        state.cash -= fill.fee;

        trade.state = TradeState::Open;
        trade.entry_bar = bar_index;
        trade.entry_time = time;
        trade.entry_price = fill.price;
        trade.size = size;
        trade.fees_accrued = fill.fee;
        trade.slippage_cost = fill.slippage_cost;
        trade.extreme_price = fill.price;
        trade.stop_price = stop;
        trade.take_profit_price = take_profit;
        if let Some(level) = stop {
            trade.stop_history.push(StopUpdate {
                bar_index,
                price: level,
            });
        }

        state.ratchet = Some(StopRatchet::with_level(trade.side, stop));
        state.position_tracker = Some(StableRegimeState::new(&config.stability));

        info!(
            symbol = %self.symbol,
            trade = %trade.id,
            side = ?trade.side,
            price = fill.price,
            size,
            "position opened"
        );
        events.push(TradeEvent::Opened {
            trade: trade.id,
            price: fill.price,
            size,
            stop,
            take_profit,
        });
    }

    fn manage_position(
        &mut self,
        bar: &Bar,
        mut exit_reason: Option<ExitReason>,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
        closed: &mut Vec<Trade>,
    ) -> Result<(), EngineError> {
        let t = self.state.bar_index;
        let Some(pin) = self.state.route else {
            return Ok(());
        };
        let strategy = &config.strategy_sets[pin.set_index].strategies[pin.strategy_index];

        if exit_reason.is_none() {
            let rule = &config.rules[pin.rule_index];
            if rule.exit_on_unmatch && !rule.matcher.matches(self.state.entry_tracker.current()) {
                exit_reason = Some(ExitReason::RegimeExit);
            }
        }
        if exit_reason.is_none() {
            if let Some(exit) = &strategy.exit {
                if evaluate(exit, &self.state.history).map_err(|e| data_error(&self.symbol, t, bar, e))? {
                    exit_reason = Some(ExitReason::ExitSignal);
                }
            }
        }

        match exit_reason {
            Some(reason) => {
                self.decide_exit(bar, reason, config, events, closed);
                Ok(())
            }
            None => self.update_trailing(bar, &strategy.risk, events),
        }
    }

    fn decide_exit(
        &mut self,
        bar: &Bar,
        reason: ExitReason,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
        closed: &mut Vec<Trade>,
    ) {
        let Some(trade) = self.state.trade.as_ref() else {
            return;
        };
        events.push(TradeEvent::ExitSignal {
            trade: trade.id,
            reason,
        });
        match config.execution.fill {
            FillModel::NextBarOpen => self.state.pending_exit = Some(reason),
            FillModel::SameBarClose => {
                let t = self.state.bar_index;
                closed.extend(self.close_trade(bar.close, reason, t, bar.close_time, config, events));
            }
        }
    }

    fn update_trailing(
        &mut self,
        bar: &Bar,
        risk: &RiskConfig,
        events: &mut Vec<TradeEvent>,
    ) -> Result<(), EngineError> {
        let t = self.state.bar_index;
        let state = &mut self.state;
        let Some(trade) = state.trade.as_mut() else {
            return Ok(());
        };
        let side = trade.side;
        trade.extreme_price = match side {
            Side::Long => trade.extreme_price.max(bar.high),
            Side::Short => trade.extreme_price.min(bar.low),
        };
        if risk.trailing_mode == TrailingMode::None {
            return Ok(());
        }
        if !trade.trailing_active {
            let excursion =
                (trade.extreme_price - trade.entry_price) * side.sign() / trade.entry_price * 100.0;
            if excursion < risk.trailing_activation_pct {
                return Ok(());
            }
            trade.trailing_active = true;
        }

        let distance = match &risk.trailing_mode {
            TrailingMode::None => return Ok(()),
            TrailingMode::Percent => trade.extreme_price * risk.trailing_multiplier / 100.0,
            TrailingMode::Indicator(id) => {
                let value = state
                    .history
                    .current()
                    .and_then(|snapshot| snapshot.resolve(id, None))
                    .ok_or_else(|| DataError::Unavailable {
                        reference: id.clone(),
                    })
                    .map_err(|e| data_error(&self.symbol, t, bar, e))?;
                value * risk.trailing_multiplier
            }
        };
        if !distance.is_finite() || distance < 0.0 {
            self.diagnostics.rejected_stop_updates += 1;
            return Ok(());
        }

        let candidate = trade.extreme_price - side.sign() * distance;
        let previous = trade.stop_price;
        let ratchet = state
            .ratchet
            .get_or_insert_with(|| StopRatchet::with_level(side, previous));
        match ratchet.propose(candidate) {
            StopProposal::Accepted(level) => {
                enforce_ratchet(trade.id, side, previous, level)
                    .map_err(|v| invariant_error(&self.symbol, t, bar, v))?;
                trade.stop_price = Some(level);
                trade.stop_history.push(StopUpdate {
                    bar_index: t,
                    price: level,
                });
                events.push(TradeEvent::StopMoved {
                    trade: trade.id,
                    from: previous,
                    to: level,
                });
            }
            StopProposal::Unchanged => {}
            StopProposal::Rejected => self.diagnostics.rejected_stop_updates += 1,
        }
        Ok(())
    }

    /// Close the current trade at `reference` (slippage and fees applied).
    fn close_trade(
        &mut self,
        reference: f64,
        reason: ExitReason,
        bar_index: usize,
        time: DateTime<Utc>,
        config: &CompiledConfig,
        events: &mut Vec<TradeEvent>,
    ) -> Option<Trade> {
        let mut trade = self.state.trade.take()?;
        let fill = price_fill(
            reference,
            trade.size,
            FillDirection::exiting(trade.side),
            &config.execution,
        );
        let gross = gross_pnl(trade.side, trade.entry_price, fill.price, trade.size);
        self.state.cash += gross - fill.fee;

        trade.state = TradeState::Closed;
        trade.fees_accrued += fill.fee;
        trade.slippage_cost += fill.slippage_cost;
        trade.exit_bar = Some(bar_index);
        trade.exit_time = Some(time);
        trade.exit_price = Some(fill.price);
        trade.exit_reason = Some(reason);
        trade.gross_pnl = gross;
        trade.net_pnl = gross - trade.fees_accrued;

        self.state.route = None;
        self.state.ratchet = None;
        self.state.pending_exit = None;
        self.state.position_tracker = None;

        info!(
            symbol = %self.symbol,
            trade = %trade.id,
            ?reason,
            price = fill.price,
            net_pnl = trade.net_pnl,
            "position closed"
        );
        events.push(TradeEvent::Closed {
            trade: trade.id,
            price: fill.price,
            reason,
            net_pnl: trade.net_pnl,
        });
        Some(trade)
    }
}

struct ProtectiveHit {
    price: f64,
    reason: ExitReason,
    at_open: bool,
}

/// Stop / target check against the bar's range. The stop is checked first.
fn protective_exit(trade: &Trade, bar: &Bar) -> Option<ProtectiveHit> {
    let hit = |price, reason, at_open| {
        Some(ProtectiveHit {
            price,
            reason,
            at_open,
        })
    };
    match trade.side {
        Side::Long => {
            if let Some(stop) = trade.stop_price {
                if bar.open <= stop {
                    return hit(bar.open, ExitReason::StopLoss, true);
                }
                if bar.low <= stop {
                    return hit(stop, ExitReason::StopLoss, false);
                }
            }
            if let Some(target) = trade.take_profit_price {
                if bar.open >= target {
                    return hit(bar.open, ExitReason::TakeProfit, true);
                }
                if bar.high >= target {
                    return hit(target, ExitReason::TakeProfit, false);
                }
            }
        }
        Side::Short => {
            if let Some(stop) = trade.stop_price {
                if bar.open >= stop {
                    return hit(bar.open, ExitReason::StopLoss, true);
                }
                if bar.high >= stop {
                    return hit(stop, ExitReason::StopLoss, false);
                }
            }
            if let Some(target) = trade.take_profit_price {
                if bar.open <= target {
                    return hit(bar.open, ExitReason::TakeProfit, true);
                }
                if bar.low <= target {
                    return hit(target, ExitReason::TakeProfit, false);
                }
            }
        }
    }
    None
}

/// Initial stop and target from the fill price.
fn initial_levels(side: Side, entry: f64, risk: &RiskConfig) -> (Option<f64>, Option<f64>) {
    let stop = risk
        .stop_loss_pct
        .map(|pct| entry * (1.0 - side.sign() * pct / 100.0));
    let target = risk
        .take_profit_pct
        .map(|pct| entry * (1.0 + side.sign() * pct / 100.0));
    (stop, target)
}

fn data_error(symbol: &str, bar_index: usize, bar: &Bar, source: DataError) -> EngineError {
    EngineError::Data {
        symbol: symbol.to_string(),
        bar_index,
        timestamp: bar.close_time,
        source,
    }
}

fn invariant_error(symbol: &str, bar_index: usize, bar: &Bar, violation: InvariantViolation) -> EngineError {
    EngineError::Invariant {
        symbol: symbol.to_string(),
        bar_index,
        timestamp: bar.close_time,
        violation,
    }
}
