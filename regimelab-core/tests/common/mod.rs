//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use regimelab_core::config::{CompiledConfig, PlatformConfig};
use regimelab_core::domain::Bar;
use regimelab_core::snapshot::IndicatorSnapshot;
use std::sync::Arc;

/// Route engine logs to the test harness; `RUST_LOG=regimelab_core=debug`
/// shows regime commits and routing decisions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// N hourly bars of a deterministic pseudo-random walk (simple LCG).
pub fn make_bars(n: usize, seed: u64) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(n);
    let mut state = seed.wrapping_add(1);
    let mut price = 40_000.0;
    for i in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let change = ((state >> 33) % 200) as f64 / 100.0 - 1.0; // -1% to +1%
        let open = price;
        let close = (price * (1.0 + change / 100.0)).max(1.0);
        let high = open.max(close) * 1.002;
        let low = open.min(close) * 0.998;
        let open_time = start() + Duration::hours(i as i64);
        bars.push(Bar {
            open_time,
            close_time: open_time + Duration::hours(1),
            open,
            high,
            low,
            close,
            volume: 1_000.0 + i as f64,
        });
        price = close;
    }
    bars
}

/// Bars with a constant price, so only decisions move equity.
pub fn flat_bars(n: usize, price: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let open_time = start() + Duration::hours(i as i64);
            Bar {
                open_time,
                close_time: open_time + Duration::hours(1),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 1.0,
            }
        })
        .collect()
}

/// One snapshot per bar built from named columns.
pub fn snapshots(n: usize, columns: &[(&str, &dyn Fn(usize) -> f64)]) -> Vec<IndicatorSnapshot> {
    (0..n)
        .map(|i| {
            columns
                .iter()
                .fold(IndicatorSnapshot::new(), |snap, (id, f)| snap.with(*id, f(i)))
        })
        .collect()
}

pub fn compile(json: &str) -> Arc<CompiledConfig> {
    let config: PlatformConfig = serde_json::from_str(json).expect("config must parse");
    Arc::new(config.compile().expect("config must compile"))
}

/// Trend regime gating an RSI cross-up entry, exit when the regime ends.
pub const TREND_RSI_CONFIG: &str = r#"{
    "base_timeframe": "1h",
    "indicators": [
        {"id": "trend", "type": "external"},
        {"id": "rsi", "type": "rsi", "params": {"period": 14}}
    ],
    "regimes": [
        {"id": "R1", "name": "uptrend", "priority": 10, "condition": "trend > 0"}
    ],
    "strategies": [
        {"id": "rsi_breakout", "side": "long", "entry": "crossover(rsi, 70)"}
    ],
    "strategy_sets": [{"id": "S1", "strategies": ["rsi_breakout"]}],
    "routing": [{"match": {"any_of": ["R1"]}, "target": "S1", "priority": 1}],
    "stability": {"confirm_bars": 3},
    "execution": {"initial_capital": 10000.0, "fee_rate": 0.0004, "slippage_bps": 2.0}
}"#;

/// `trend` is 1 on bars 40..=80, `rsi` crosses above 70 on bar 50.
pub fn trend_rsi_snapshots(n: usize) -> Vec<IndicatorSnapshot> {
    snapshots(
        n,
        &[
            ("trend", &|i| if (40..=80).contains(&i) { 1.0 } else { 0.0 }),
            ("rsi", &|i| if i >= 50 { 75.0 } else { 50.0 }),
        ],
    )
}
