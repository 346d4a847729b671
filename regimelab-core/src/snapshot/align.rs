//! Multi-timeframe snapshot alignment.
//!
//! Higher-timeframe snapshots become visible on the first base bar whose
//! close time is at or after theirs and are then carried forward until the
//! next one closes. Nothing is ever back-filled: a base bar closing before
//! the first higher-timeframe close simply lacks those ids.

use super::{IndicatorSnapshot, TimedSnapshot};
use crate::domain::Timeframe;
use crate::error::FeedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Snapshots for one higher timeframe, ordered by close time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeFeed {
    pub timeframe: Timeframe,
    pub snapshots: Vec<TimedSnapshot>,
}

impl TimeframeFeed {
    pub fn new(timeframe: Timeframe, snapshots: Vec<TimedSnapshot>) -> Self {
        Self {
            timeframe,
            snapshots,
        }
    }

    fn validate_order(&self) -> Result<(), FeedError> {
        for (index, pair) in self.snapshots.windows(2).enumerate() {
            if pair[1].close_time <= pair[0].close_time {
                return Err(FeedError::HigherTimeframeOutOfOrder {
                    timeframe: self.timeframe,
                    index: index + 1,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FeedCursor {
    timeframe: Timeframe,
    queued: VecDeque<TimedSnapshot>,
    last_queued: Option<DateTime<Utc>>,
    latest: Option<IndicatorSnapshot>,
}

impl FeedCursor {
    /// Promote every queued snapshot that has closed by `now`.
    fn advance(&mut self, now: DateTime<Utc>) {
        while self.queued.front().is_some_and(|s| s.close_time <= now) {
            if let Some(closed) = self.queued.pop_front() {
                self.latest = Some(closed.snapshot);
            }
        }
    }
}

/// Forward-fills higher-timeframe snapshots onto base-timeframe bars.
///
/// Used by both the backtest loop (feeds supplied up front) and live sessions
/// (feeds pushed as higher-timeframe bars close).
#[derive(Debug, Clone)]
pub struct SnapshotAligner {
    base: Timeframe,
    cursors: Vec<FeedCursor>,
}

impl SnapshotAligner {
    /// Build an aligner over complete feeds.
    ///
    /// Feeds are ordered by timeframe so merge order never depends on input order.
    pub fn new(base: Timeframe, feeds: Vec<TimeframeFeed>) -> Result<Self, FeedError> {
        let mut aligner = Self {
            base,
            cursors: Vec::new(),
        };
        let mut feeds = feeds;
        feeds.sort_by_key(|f| f.timeframe);
        for feed in feeds {
            aligner.check_timeframe(feed.timeframe)?;
            feed.validate_order()?;
            let last_queued = feed.snapshots.last().map(|s| s.close_time);
            aligner.cursors.push(FeedCursor {
                timeframe: feed.timeframe,
                queued: feed.snapshots.into(),
                last_queued,
                latest: None,
            });
        }
        Ok(aligner)
    }

    pub fn base(&self) -> Timeframe {
        self.base
    }

    /// Queue a higher-timeframe snapshot as its bar closes (live feeds).
    pub fn push(&mut self, timeframe: Timeframe, snapshot: TimedSnapshot) -> Result<(), FeedError> {
        self.check_timeframe(timeframe)?;
        let position = match self.cursors.iter().position(|c| c.timeframe == timeframe) {
            Some(p) => p,
            None => {
                let insert_at = self
                    .cursors
                    .iter()
                    .position(|c| c.timeframe > timeframe)
                    .unwrap_or(self.cursors.len());
                self.cursors.insert(
                    insert_at,
                    FeedCursor {
                        timeframe,
                        queued: VecDeque::new(),
                        last_queued: None,
                        latest: None,
                    },
                );
                insert_at
            }
        };
        let cursor = &mut self.cursors[position];
        if cursor
            .last_queued
            .is_some_and(|last| snapshot.close_time <= last)
        {
            return Err(FeedError::HigherTimeframeOutOfOrder {
                timeframe,
                index: cursor.queued.len(),
            });
        }
        cursor.last_queued = Some(snapshot.close_time);
        cursor.queued.push_back(snapshot);
        Ok(())
    }

    /// Merge the base snapshot with every higher-timeframe snapshot closed by `now`.
    ///
    /// Base ids win on collision; backtests reject collisions up front with
    /// [`check_disjoint_ids`].
    pub fn align(&mut self, now: DateTime<Utc>, base: &IndicatorSnapshot) -> IndicatorSnapshot {
        let mut merged = base.clone();
        for cursor in &mut self.cursors {
            cursor.advance(now);
            if let Some(latest) = &cursor.latest {
                merged.merge_missing(latest);
            }
        }
        merged
    }

    fn check_timeframe(&self, timeframe: Timeframe) -> Result<(), FeedError> {
        if timeframe <= self.base {
            return Err(FeedError::NotHigherTimeframe {
                timeframe,
                base: self.base,
            });
        }
        Ok(())
    }
}

/// Reject an indicator id that appears in more than one feed (base included).
pub fn check_disjoint_ids(
    base: &[IndicatorSnapshot],
    feeds: &[TimeframeFeed],
) -> Result<(), FeedError> {
    let mut owners: Vec<BTreeSet<&str>> = Vec::with_capacity(feeds.len() + 1);
    owners.push(base.iter().flat_map(|s| s.ids()).collect());
    for feed in feeds {
        owners.push(
            feed.snapshots
                .iter()
                .flat_map(|s| s.snapshot.ids())
                .collect(),
        );
    }
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for ids in &owners {
        for id in ids {
            if !seen.insert(id) {
                return Err(FeedError::DuplicateIndicator { id: id.to_string() });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn h4(close_hour: u32, value: f64) -> TimedSnapshot {
        TimedSnapshot {
            close_time: at(close_hour),
            snapshot: IndicatorSnapshot::new().with("trend_4h", value),
        }
    }

    #[test]
    fn forward_fills_between_higher_closes() {
        let feed = TimeframeFeed::new(Timeframe::H4, vec![h4(4, 1.0), h4(8, 2.0)]);
        let mut aligner = SnapshotAligner::new(Timeframe::H1, vec![feed]).unwrap();
        let base = IndicatorSnapshot::new().with("rsi", 50.0);

        let s3 = aligner.align(at(3), &base);
        assert!(!s3.contains("trend_4h"), "no back-fill before first close");

        let s4 = aligner.align(at(4), &base);
        assert_eq!(s4.resolve("trend_4h", None), Some(1.0));

        let s7 = aligner.align(at(7), &base);
        assert_eq!(s7.resolve("trend_4h", None), Some(1.0));

        let s8 = aligner.align(at(8), &base);
        assert_eq!(s8.resolve("trend_4h", None), Some(2.0));
        assert_eq!(s8.resolve("rsi", None), Some(50.0));
    }

    #[test]
    fn rejects_out_of_order_feed() {
        let feed = TimeframeFeed::new(Timeframe::H4, vec![h4(8, 1.0), h4(4, 2.0)]);
        let err = SnapshotAligner::new(Timeframe::H1, vec![feed]).unwrap_err();
        assert!(matches!(err, FeedError::HigherTimeframeOutOfOrder { index: 1, .. }));
    }

    #[test]
    fn rejects_feed_not_coarser_than_base() {
        let feed = TimeframeFeed::new(Timeframe::H1, vec![]);
        let err = SnapshotAligner::new(Timeframe::H4, vec![feed]).unwrap_err();
        assert!(matches!(err, FeedError::NotHigherTimeframe { .. }));
    }

    #[test]
    fn live_push_respects_order() {
        let mut aligner = SnapshotAligner::new(Timeframe::H1, vec![]).unwrap();
        aligner.push(Timeframe::H4, h4(4, 1.0)).unwrap();
        assert!(aligner.push(Timeframe::H4, h4(4, 2.0)).is_err());
        let merged = aligner.align(at(5), &IndicatorSnapshot::new());
        assert_eq!(merged.resolve("trend_4h", None), Some(1.0));
    }

    #[test]
    fn duplicate_ids_across_feeds_rejected() {
        let base = vec![IndicatorSnapshot::new().with("trend_4h", 1.0)];
        let feeds = vec![TimeframeFeed::new(Timeframe::H4, vec![h4(4, 1.0)])];
        let err = check_disjoint_ids(&base, &feeds).unwrap_err();
        assert_eq!(
            err,
            FeedError::DuplicateIndicator {
                id: "trend_4h".into()
            }
        );
    }
}
