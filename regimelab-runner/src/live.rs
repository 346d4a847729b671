//! Live and paper coordination: one serialized session per symbol.
//!
//! Each symbol owns a [`SymbolEngine`] and a snapshot aligner behind its own
//! mutex: bars for one symbol are processed strictly in order, while
//! different symbols step concurrently from any thread. The step is the same
//! one backtests use, so replaying history through a session reproduces the
//! backtest decision-for-decision.
//!
//! Engine decisions become [`OrderIntent`]s handed to an [`ExecutionAdapter`];
//! committed entry-regime changes are published on an `mpsc` channel. Both
//! happen while the symbol's session is still locked, so the adapter sees one
//! symbol's intents in bar order.

use regimelab_core::config::CompiledConfig;
use regimelab_core::domain::{Bar, ExitReason, Side, Timeframe, Trade, TradeId};
use regimelab_core::engine::{
    Diagnostics, EquityPoint, RegimeChange, StepOutcome, SymbolEngine, TrackerScope, TradeEvent,
};
use regimelab_core::regime::ActiveRegimeSet;
use regimelab_core::snapshot::{IndicatorSnapshot, SnapshotAligner, TimedSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::RunnerError;

/// What the engine wants the exchange side to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum OrderIntent {
    Enter {
        trade: TradeId,
        side: Side,
        strategy_id: String,
        reference_price: f64,
    },
    Exit { trade: TradeId, reason: ExitReason },
    /// Replace the protective stop. Levels only ever tighten.
    ReplaceStop { trade: TradeId, stop: f64 },
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderIntent::Enter { trade, side, .. } => write!(f, "enter {side:?} {trade}"),
            OrderIntent::Exit { trade, reason } => write!(f, "exit {trade} ({reason:?})"),
            OrderIntent::ReplaceStop { trade, stop } => write!(f, "stop {trade} -> {stop}"),
        }
    }
}

impl OrderIntent {
    /// Intents implied by one bar's trade events.
    ///
    /// Stop-loss, take-profit and end-of-data closes are not intents: the
    /// protective orders already resting on the exchange cover them.
    pub fn from_events(events: &[TradeEvent]) -> Vec<OrderIntent> {
        events
            .iter()
            .filter_map(|event| match event {
                TradeEvent::EntrySignal {
                    trade,
                    strategy_id,
                    side,
                    reference_price,
                } => Some(OrderIntent::Enter {
                    trade: *trade,
                    side: *side,
                    strategy_id: strategy_id.clone(),
                    reference_price: *reference_price,
                }),
                TradeEvent::Opened {
                    trade,
                    stop: Some(stop),
                    ..
                } => Some(OrderIntent::ReplaceStop {
                    trade: *trade,
                    stop: *stop,
                }),
                TradeEvent::StopMoved { trade, to, .. } => Some(OrderIntent::ReplaceStop {
                    trade: *trade,
                    stop: *to,
                }),
                TradeEvent::ExitSignal { trade, reason } => Some(OrderIntent::Exit {
                    trade: *trade,
                    reason: *reason,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Exchange-side collaborator. Implementations must be callable from any
/// session thread.
pub trait ExecutionAdapter: Send + Sync {
    fn submit(&self, symbol: &str, intent: &OrderIntent) -> anyhow::Result<()>;
}

/// Paper adapter: records intents in submission order.
#[derive(Debug, Default)]
pub struct PaperAdapter {
    submitted: Mutex<Vec<(String, OrderIntent)>>,
}

impl PaperAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<(String, OrderIntent)> {
        self.submitted
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl ExecutionAdapter for PaperAdapter {
    fn submit(&self, symbol: &str, intent: &OrderIntent) -> anyhow::Result<()> {
        self.submitted
            .lock()
            .map_err(|_| anyhow::anyhow!("paper log poisoned"))?
            .push((symbol.to_string(), intent.clone()));
        Ok(())
    }
}

/// Published whenever a symbol commits a new entry-scope regime set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeNotice {
    pub symbol: String,
    pub bar_index: usize,
    pub old: ActiveRegimeSet,
    pub new: ActiveRegimeSet,
    /// Strategy set the router now selects, if any.
    pub strategy_set: Option<String>,
}

/// An intent the adapter refused. The engine state has already advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedIntent {
    pub intent: OrderIntent,
    pub message: String,
}

/// Everything a session reports for one closed bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub symbol: String,
    pub bar_index: usize,
    pub active_regimes: ActiveRegimeSet,
    pub active_strategy_set: Option<String>,
    pub transitions: Vec<RegimeChange>,
    pub events: Vec<TradeEvent>,
    pub intents: Vec<OrderIntent>,
    /// Intents the adapter rejected; the rest were still submitted.
    pub failed_intents: Vec<FailedIntent>,
    pub closed: Vec<Trade>,
    pub equity: EquityPoint,
}

struct SymbolSession {
    engine: SymbolEngine,
    aligner: SnapshotAligner,
}

/// Coordinates live sessions across symbols.
pub struct LiveCoordinator {
    config: Arc<CompiledConfig>,
    sessions: RwLock<BTreeMap<String, Arc<Mutex<SymbolSession>>>>,
    adapter: Option<Arc<dyn ExecutionAdapter>>,
    notices: Option<Mutex<Sender<RegimeNotice>>>,
}

impl LiveCoordinator {
    pub fn new(config: Arc<CompiledConfig>) -> Self {
        Self {
            config,
            sessions: RwLock::new(BTreeMap::new()),
            adapter: None,
            notices: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_notifier(mut self, sender: Sender<RegimeNotice>) -> Self {
        self.notices = Some(Mutex::new(sender));
        self
    }

    pub fn config(&self) -> &Arc<CompiledConfig> {
        &self.config
    }

    pub fn symbols(&self) -> Vec<String> {
        self.sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a session for `symbol` with no pending higher-timeframe data.
    pub fn add_symbol(&self, symbol: &str) -> Result<(), RunnerError> {
        let aligner = SnapshotAligner::new(self.config.base_timeframe, Vec::new())?;
        let session = SymbolSession {
            engine: SymbolEngine::new(symbol, Arc::clone(&self.config)),
            aligner,
        };
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?;
        if sessions.contains_key(symbol) {
            return Err(RunnerError::DuplicateSymbol(symbol.to_string()));
        }
        sessions.insert(symbol.to_string(), Arc::new(Mutex::new(session)));
        info!(symbol, "live session opened");
        Ok(())
    }

    /// Queue a closed higher-timeframe snapshot. It becomes visible to the
    /// first base bar closing at or after its close time.
    pub fn push_higher_timeframe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        snapshot: TimedSnapshot,
    ) -> Result<(), RunnerError> {
        let session = self.session(symbol)?;
        let mut session = session
            .lock()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?;
        session.aligner.push(timeframe, snapshot)?;
        Ok(())
    }

    /// Process one closed base bar for `symbol`.
    ///
    /// Adapter rejections do not fail the call: the engine has already
    /// stepped, so they are reported in [`LiveUpdate::failed_intents`].
    pub fn on_bar_close(
        &self,
        symbol: &str,
        bar: &Bar,
        snapshot: IndicatorSnapshot,
    ) -> Result<LiveUpdate, RunnerError> {
        let session = self.session(symbol)?;
        let mut session = session
            .lock()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?;
        let merged = session.aligner.align(bar.close_time, &snapshot);
        let outcome = session.engine.step(bar, merged)?;

        let update = self.publish(symbol, outcome);
        drop(session);
        debug!(
            symbol,
            bar_index = update.bar_index,
            regimes = %update.active_regimes,
            intents = update.intents.len(),
            failed = update.failed_intents.len(),
            "bar processed"
        );
        Ok(update)
    }

    /// Close the session, flattening any open position at the last close.
    pub fn close_symbol(&self, symbol: &str) -> Result<(Option<Trade>, Diagnostics), RunnerError> {
        let session = self
            .sessions
            .write()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?
            .remove(symbol)
            .ok_or_else(|| RunnerError::UnknownSymbol(symbol.to_string()))?;
        let mut session = session
            .lock()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?;
        let trade = session.engine.finish();
        if let Some(trade) = &trade {
            info!(symbol, trade = %trade.id, net_pnl = trade.net_pnl, "position flattened at shutdown");
        }
        Ok((trade, session.engine.diagnostics().clone()))
    }

    fn session(&self, symbol: &str) -> Result<Arc<Mutex<SymbolSession>>, RunnerError> {
        self.sessions
            .read()
            .map_err(|_| RunnerError::SessionPoisoned(symbol.to_string()))?
            .get(symbol)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownSymbol(symbol.to_string()))
    }

    /// Caller holds the symbol's session lock.
    fn publish(&self, symbol: &str, outcome: StepOutcome) -> LiveUpdate {
        let intents = OrderIntent::from_events(&outcome.events);
        let mut failed_intents = Vec::new();
        if let Some(adapter) = &self.adapter {
            for intent in &intents {
                if let Err(e) = adapter.submit(symbol, intent) {
                    warn!(symbol, %intent, error = %e, "execution adapter rejected intent");
                    failed_intents.push(FailedIntent {
                        intent: intent.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for change in outcome
            .transitions
            .iter()
            .filter(|c| c.scope == TrackerScope::Entry)
        {
            info!(
                symbol,
                bar_index = change.bar_index,
                from = %change.from,
                to = %change.to,
                strategy_set = outcome.active_strategy_set.as_deref().unwrap_or("-"),
                "regime changed"
            );
            if let Some(sender) = &self.notices {
                let notice = RegimeNotice {
                    symbol: symbol.to_string(),
                    bar_index: change.bar_index,
                    old: change.from.clone(),
                    new: change.to.clone(),
                    strategy_set: outcome.active_strategy_set.clone(),
                };
                let delivered = sender.lock().map(|tx| tx.send(notice).is_ok()).unwrap_or(false);
                if !delivered {
                    warn!(symbol, "regime notice dropped; receiver gone");
                }
            }
        }

        LiveUpdate {
            symbol: symbol.to_string(),
            bar_index: outcome.bar_index,
            active_regimes: outcome.active_regimes,
            active_strategy_set: outcome.active_strategy_set,
            transitions: outcome.transitions,
            events: outcome.events,
            intents,
            failed_intents,
            closed: outcome.closed,
            equity: outcome.equity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regimelab_core::config::PlatformConfig;
    use chrono::{Duration, TimeZone, Utc};

    fn coordinator() -> LiveCoordinator {
        let config: PlatformConfig = serde_json::from_str(
            r#"{
                "indicators": [{"id": "x", "type": "external"}],
                "regimes": [{"id": "on", "condition": "x > 0"}],
                "strategies": [{"id": "s", "entry": "x > 1", "exit": "x < 1",
                                "risk": {"stop_loss_pct": 5.0}}],
                "strategy_sets": [{"id": "set", "strategies": ["s"]}],
                "routing": [{"match": {"any_of": ["on"]}, "target": "set"}],
                "stability": {"confirm_bars": 1}
            }"#,
        )
        .unwrap();
        LiveCoordinator::new(Arc::new(config.compile().unwrap()))
    }

    fn bar(i: i64) -> Bar {
        let open_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(i);
        Bar {
            open_time,
            close_time: open_time + Duration::hours(1),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1.0,
        }
    }

    #[test]
    fn unknown_symbol_rejected() {
        let live = coordinator();
        let err = live.on_bar_close("BTCUSDT", &bar(0), IndicatorSnapshot::new()).unwrap_err();
        assert!(matches!(err, RunnerError::UnknownSymbol(_)));
    }

    #[test]
    fn duplicate_symbol_rejected() {
        let live = coordinator();
        live.add_symbol("BTCUSDT").unwrap();
        assert!(matches!(live.add_symbol("BTCUSDT"), Err(RunnerError::DuplicateSymbol(_))));
    }

    #[test]
    fn intents_and_notices_follow_decisions() {
        let (tx, rx) = std::sync::mpsc::channel();
        let paper = Arc::new(PaperAdapter::new());
        let live = coordinator()
            .with_adapter(paper.clone())
            .with_notifier(tx);
        live.add_symbol("BTCUSDT").unwrap();

        let x = [2.0, 2.0, 0.5];
        for (i, v) in x.iter().enumerate() {
            live.on_bar_close("BTCUSDT", &bar(i as i64), IndicatorSnapshot::new().with("x", *v))
                .unwrap();
        }

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.bar_index, 0);
        assert!(notice.new.contains("on"));
        assert_eq!(notice.strategy_set.as_deref(), Some("set"));

        let intents: Vec<OrderIntent> = paper.submitted().into_iter().map(|(_, i)| i).collect();
        assert!(matches!(intents[0], OrderIntent::Enter { side: Side::Long, .. }));
        assert!(matches!(intents[1], OrderIntent::ReplaceStop { stop, .. } if (stop - 95.0).abs() < 1e-9));
        assert!(matches!(intents[2], OrderIntent::Exit { reason: ExitReason::ExitSignal, .. }));
        assert_eq!(intents.len(), 3);
    }

    #[test]
    fn close_symbol_flattens() {
        let live = coordinator();
        live.add_symbol("ETHUSDT").unwrap();
        for i in 0..3 {
            live.on_bar_close("ETHUSDT", &bar(i), IndicatorSnapshot::new().with("x", 2.0))
                .unwrap();
        }
        let (trade, _) = live.close_symbol("ETHUSDT").unwrap();
        assert_eq!(trade.unwrap().exit_reason, Some(ExitReason::EndOfData));
        assert!(live.symbols().is_empty());
    }

    /// Records intents after an optional hold on `Enter`, and rejects
    /// whatever `reject` matches.
    struct ScriptedAdapter {
        log: Mutex<Vec<OrderIntent>>,
        hold_enter: Option<(Mutex<std::sync::mpsc::Sender<()>>, Mutex<std::sync::mpsc::Receiver<()>>)>,
        reject: fn(&OrderIntent) -> bool,
    }

    impl ScriptedAdapter {
        fn log(&self) -> Vec<OrderIntent> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ExecutionAdapter for ScriptedAdapter {
        fn submit(&self, _symbol: &str, intent: &OrderIntent) -> anyhow::Result<()> {
            if let (OrderIntent::Enter { .. }, Some((started, release))) = (intent, &self.hold_enter) {
                started.lock().unwrap().send(()).unwrap();
                release
                    .lock()
                    .unwrap()
                    .recv_timeout(std::time::Duration::from_secs(5))
                    .unwrap();
            }
            if (self.reject)(intent) {
                anyhow::bail!("exchange unavailable");
            }
            self.log.lock().unwrap().push(intent.clone());
            Ok(())
        }
    }

    #[test]
    fn same_symbol_intents_reach_the_adapter_in_bar_order() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let adapter = Arc::new(ScriptedAdapter {
            log: Mutex::new(Vec::new()),
            hold_enter: Some((Mutex::new(started_tx), Mutex::new(release_rx))),
            reject: |_| false,
        });
        let live = coordinator().with_adapter(adapter.clone());
        live.add_symbol("BTCUSDT").unwrap();

        std::thread::scope(|scope| {
            // Bar 0 signals the entry; the adapter holds it.
            let first = scope.spawn(|| {
                live.on_bar_close("BTCUSDT", &bar(0), IndicatorSnapshot::new().with("x", 2.0))
            });
            started_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();

            // Bar 1 fills the entry, places its stop and signals the exit.
            let second = scope.spawn(|| {
                live.on_bar_close("BTCUSDT", &bar(1), IndicatorSnapshot::new().with("x", 0.5))
            });
            std::thread::sleep(std::time::Duration::from_millis(100));
            release_tx.send(()).unwrap();

            first.join().unwrap().unwrap();
            second.join().unwrap().unwrap();
        });

        let log = adapter.log();
        assert_eq!(log.len(), 3, "{log:?}");
        assert!(matches!(log[0], OrderIntent::Enter { .. }));
        assert!(matches!(log[1], OrderIntent::ReplaceStop { .. }));
        assert!(matches!(log[2], OrderIntent::Exit { .. }));
    }

    #[test]
    fn adapter_rejection_keeps_the_update_and_later_intents() {
        let adapter = Arc::new(ScriptedAdapter {
            log: Mutex::new(Vec::new()),
            hold_enter: None,
            reject: |intent| matches!(intent, OrderIntent::ReplaceStop { .. }),
        });
        let live = coordinator().with_adapter(adapter.clone());
        live.add_symbol("BTCUSDT").unwrap();

        live.on_bar_close("BTCUSDT", &bar(0), IndicatorSnapshot::new().with("x", 2.0))
            .unwrap();
        // Bar 1 yields a stop placement followed by an exit signal.
        let update = live
            .on_bar_close("BTCUSDT", &bar(1), IndicatorSnapshot::new().with("x", 0.5))
            .unwrap();

        assert_eq!(update.bar_index, 1);
        assert_eq!(update.intents.len(), 2);
        assert_eq!(update.failed_intents.len(), 1);
        assert!(matches!(update.failed_intents[0].intent, OrderIntent::ReplaceStop { .. }));
        assert!(update.failed_intents[0].message.contains("exchange unavailable"));
        assert!(update
            .events
            .iter()
            .any(|e| matches!(e, TradeEvent::Opened { .. })));

        let log = adapter.log();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0], OrderIntent::Enter { .. }));
        assert!(matches!(log[1], OrderIntent::Exit { .. }));

        // The session keeps stepping after a rejection.
        let next = live
            .on_bar_close("BTCUSDT", &bar(2), IndicatorSnapshot::new().with("x", 0.5))
            .unwrap();
        assert_eq!(next.bar_index, 2);
        assert_eq!(next.closed.len(), 1);
    }
}
