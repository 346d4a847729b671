//! Criterion benchmarks for RegimeLab hot paths.
//!
//! Benchmarks:
//! 1. Condition compile (parse + validate)
//! 2. Condition evaluation (nested groups, crossover, percentile window)
//! 3. Regime classification + stability update per bar
//! 4. Full backtest over synthetic hourly bars

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use regimelab_core::condition::{evaluate, ConditionCompiler, ConditionLimits, ConditionSource};
use regimelab_core::config::{PlatformConfig, RegimeScope, StabilityConfig};
use regimelab_core::domain::Bar;
use regimelab_core::engine::{run_backtest, BacktestInput};
use regimelab_core::regime::{classify, StableRegimeState};
use regimelab_core::snapshot::{IndicatorSnapshot, SnapshotHistory};

// ── Helpers ──────────────────────────────────────────────────────────

const EXPR: &str = "(adx > 25 and between(rsi, 40, 70)) or \
                    (crossover(ema_fast, ema_slow) and not atr > percentile(atr, 50, 90))";

fn make_snapshot(i: usize) -> IndicatorSnapshot {
    let x = i as f64 * 0.1;
    IndicatorSnapshot::new()
        .with("adx", 20.0 + x.sin() * 10.0)
        .with("rsi", 50.0 + x.cos() * 25.0)
        .with("ema_fast", 100.0 + x.sin() * 3.0)
        .with("ema_slow", 100.0 + (x - 0.5).sin() * 3.0)
        .with("atr", 2.0 + (x * 0.3).sin())
}

fn make_history(n: usize) -> SnapshotHistory {
    let mut history = SnapshotHistory::new(n);
    for i in 0..n {
        history.push(make_snapshot(i));
    }
    history
}

fn make_bars(n: usize) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let close = 30_000.0 + (i as f64 * 0.05).sin() * 1_500.0;
            let open_time = start + Duration::hours(i as i64);
            Bar {
                open_time,
                close_time: open_time + Duration::hours(1),
                open: close - 20.0,
                high: close + 60.0,
                low: close - 80.0,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

fn indicator_ids() -> BTreeSet<String> {
    ["adx", "rsi", "ema_fast", "ema_slow", "atr"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn bench_config() -> PlatformConfig {
    serde_json::from_str(
        r#"{
            "indicators": [
                {"id": "adx", "type": "adx"}, {"id": "rsi", "type": "rsi"},
                {"id": "ema_fast", "type": "ema"}, {"id": "ema_slow", "type": "ema"},
                {"id": "atr", "type": "atr"}
            ],
            "regimes": [
                {"id": "trend", "priority": 2, "condition": "adx > 25"},
                {"id": "calm", "priority": 1, "condition": "atr < percentile(atr, 50, 50)"}
            ],
            "strategies": [
                {"id": "cross", "entry": "crossover(ema_fast, ema_slow)", "exit": "rsi > 70",
                 "risk": {"stop_loss_pct": 2.0, "trailing_mode": {"indicator": "atr"}, "trailing_multiplier": 3.0}}
            ],
            "strategy_sets": [{"id": "set", "strategies": ["cross"]}],
            "routing": [{"match": {"any_of": ["trend", "calm"]}, "target": "set"}]
        }"#,
    )
    .unwrap()
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_compile(c: &mut Criterion) {
    let ids = indicator_ids();
    let source = ConditionSource::from(EXPR);
    c.bench_function("condition_compile", |b| {
        b.iter(|| {
            let mut compiler = ConditionCompiler::new(ConditionLimits::default()).with_indicators(&ids);
            black_box(compiler.compile(black_box(&source)).unwrap())
        })
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let ids = indicator_ids();
    let condition = ConditionCompiler::new(ConditionLimits::default())
        .with_indicators(&ids)
        .compile(&ConditionSource::from(EXPR))
        .unwrap();
    let history = make_history(64);
    c.bench_function("condition_evaluate", |b| {
        b.iter(|| black_box(evaluate(black_box(&condition), black_box(&history))))
    });
}

fn bench_classify(c: &mut Criterion) {
    let compiled = bench_config().compile().unwrap();
    let stability = StabilityConfig::default();
    let histories: Vec<SnapshotHistory> = (0..32)
        .map(|offset| {
            let mut h = SnapshotHistory::new(compiled.history_capacity);
            for i in offset..offset + compiled.history_capacity {
                h.push(make_snapshot(i));
            }
            h
        })
        .collect();
    c.bench_function("classify_and_stabilize_32_bars", |b| {
        b.iter(|| {
            let mut tracker = StableRegimeState::new(&stability);
            for history in &histories {
                let observed = classify(&compiled.regimes, history, RegimeScope::Entry).unwrap();
                black_box(tracker.update(observed, &stability));
            }
        })
    });
}

fn bench_backtest(c: &mut Criterion) {
    let config = Arc::new(bench_config().compile().unwrap());
    let mut group = c.benchmark_group("backtest");
    for &n in &[1_000usize, 10_000] {
        let input = BacktestInput::new("BTCUSDT", make_bars(n), (0..n).map(make_snapshot).collect());
        group.bench_with_input(BenchmarkId::from_parameter(n), &input, |b, input| {
            b.iter(|| black_box(run_backtest(&config, input, None).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_evaluate, bench_classify, bench_backtest);
criterion_main!(benches);
