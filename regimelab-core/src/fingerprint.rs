//! Run fingerprinting: deterministic identification of configs, datasets and results.
//!
//! - `ConfigHash`: BLAKE3 of the canonical config JSON.
//! - `DatasetHash`: BLAKE3 of the bars, base snapshots and higher-timeframe feeds.
//! - `ResultHash`: BLAKE3 of trades, regime history and equity curve.
//!
//! Canonical serialization relies on `BTreeMap` everywhere a map is serialized,
//! so key order never depends on insertion order or a hasher seed.

use crate::config::PlatformConfig;
use crate::domain::{Bar, ConfigHash, DatasetHash, ResultHash, Trade};
use crate::engine::{EquityPoint, RegimeChange};
use crate::snapshot::{IndicatorSnapshot, TimeframeFeed};
use serde::{Deserialize, Serialize};

/// The three hashes identifying one backtest run.
///
/// Two runs with equal `config_hash` and `dataset_hash` must produce equal
/// `result_hash`; anything else is a determinism bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFingerprint {
    pub config_hash: ConfigHash,
    pub dataset_hash: DatasetHash,
    pub result_hash: ResultHash,
}

pub fn config_hash(config: &PlatformConfig) -> ConfigHash {
    let json = serde_json::to_string(config).expect("PlatformConfig must serialize");
    ConfigHash::from_bytes(json.as_bytes())
}

pub fn dataset_hash(
    bars: &[Bar],
    snapshots: &[IndicatorSnapshot],
    feeds: &[TimeframeFeed],
) -> DatasetHash {
    #[derive(Serialize)]
    struct Dataset<'a> {
        bars: &'a [Bar],
        snapshots: &'a [IndicatorSnapshot],
        feeds: &'a [TimeframeFeed],
    }
    let json = serde_json::to_string(&Dataset {
        bars,
        snapshots,
        feeds,
    })
    .expect("dataset must serialize");
    DatasetHash::from_bytes(json.as_bytes())
}

pub fn result_hash(
    trades: &[Trade],
    regime_history: &[RegimeChange],
    equity_curve: &[EquityPoint],
) -> ResultHash {
    #[derive(Serialize)]
    struct Outcome<'a> {
        trades: &'a [Trade],
        regime_history: &'a [RegimeChange],
        equity_curve: &'a [EquityPoint],
    }
    let json = serde_json::to_string(&Outcome {
        trades,
        regime_history,
        equity_curve,
    })
    .expect("result must serialize");
    ResultHash::from_bytes(json.as_bytes())
}
