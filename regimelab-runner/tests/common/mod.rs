//! Shared fixtures for runner integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use regimelab_core::config::PlatformConfig;
use regimelab_core::domain::{Bar, Timeframe};
use regimelab_core::engine::BacktestInput;
use regimelab_core::snapshot::{IndicatorSnapshot, TimedSnapshot, TimeframeFeed};

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
        let change = ((state >> 33) % 300) as f64 / 100.0 - 1.5; // -1.5% to +1.5%
        let open = price;
        let close = (price * (1.0 + change / 100.0)).max(1.0);
        let open_time = start() + Duration::hours(i as i64);
        bars.push(Bar {
            open_time,
            close_time: open_time + Duration::hours(1),
            open,
            high: open.max(close) * 1.003,
            low: open.min(close) * 0.997,
            close,
            volume: 500.0,
        });
        price = close;
    }
    bars
}

/// Base-timeframe signal: +1 for five bars, -1 for five bars.
pub fn signal_snapshots(n: usize) -> Vec<IndicatorSnapshot> {
    (0..n)
        .map(|i| {
            let x = if (i / 5) % 2 == 0 { 1.0 } else { -1.0 };
            IndicatorSnapshot::new().with("x", x)
        })
        .collect()
}

/// 4h trend feed covering `n` hourly bars; alternates every three 4h bars.
pub fn trend_feed(n: usize) -> TimeframeFeed {
    let snapshots = (0..n / 4)
        .map(|k| TimedSnapshot {
            close_time: start() + Duration::hours(4 * (k as i64 + 1)),
            snapshot: IndicatorSnapshot::new().with("trend", if (k / 3) % 2 == 0 { 1.0 } else { -1.0 }),
        })
        .collect();
    TimeframeFeed::new(Timeframe::H4, snapshots)
}

pub fn input(symbol: &str, n: usize, seed: u64) -> BacktestInput {
    BacktestInput::new(symbol, make_bars(n, seed), signal_snapshots(n)).with_feed(trend_feed(n))
}

/// Hourly signal gated by a 4h trend regime, with a stop and a trailing stop.
pub const MTF_CONFIG: &str = r#"{
    "base_timeframe": "1h",
    "indicators": [
        {"id": "x", "type": "external"},
        {"id": "trend", "type": "external", "timeframe": "4h"}
    ],
    "regimes": [
        {"id": "up", "priority": 2, "condition": "trend > 0"},
        {"id": "down", "priority": 1, "condition": "trend < 0"}
    ],
    "strategies": [
        {"id": "long_x", "side": "long", "entry": "x > 0", "exit": "x < 0",
         "risk": {"stop_loss_pct": 1.0, "take_profit_pct": 3.0}},
        {"id": "short_x", "side": "short", "entry": "x < 0", "exit": "x > 0",
         "risk": {"stop_loss_pct": 1.0}}
    ],
    "strategy_sets": [
        {"id": "longs", "strategies": ["long_x"]},
        {"id": "shorts", "strategies": ["short_x"]}
    ],
    "routing": [
        {"match": {"any_of": ["up"]}, "target": "longs", "priority": 2},
        {"match": {"any_of": ["down"]}, "target": "shorts", "priority": 1}
    ],
    "stability": {"confirm_bars": 2},
    "execution": {"initial_capital": 10000.0, "fee_rate": 0.0004, "slippage_bps": 1.0}
}"#;

pub fn base_config() -> PlatformConfig {
    serde_json::from_str(MTF_CONFIG).expect("config must parse")
}
