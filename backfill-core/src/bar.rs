use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time (UTC).
    pub ts: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume (zero for midpoint series).
    pub volume: f64,
}

impl Bar {
    /// Flat bar at `price` with no volume; convenient for fixtures.
    #[must_use]
    pub const fn flat(ts: DateTime<Utc>, price: f64) -> Self {
        Self {
            ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }
}

/// Merge `incoming` into `existing` by timestamp.
///
/// The result is sorted ascending with one bar per timestamp; on collisions the
/// incoming bar wins, since a fresh fetch supersedes what was stored.
#[must_use]
pub fn merge_bars(existing: &[Bar], incoming: &[Bar]) -> Vec<Bar> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
    for b in existing.iter().chain(incoming) {
        by_ts.insert(b.ts, *b);
    }
    by_ts.into_values().collect()
}

/// Earliest timestamp in a slice of bars, regardless of ordering.
#[must_use]
pub fn earliest_timestamp(bars: &[Bar]) -> Option<DateTime<Utc>> {
    bars.iter().map(|b| b.ts).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn merge_prefers_incoming_and_sorts() {
        let existing = vec![Bar::flat(at(3), 1.0), Bar::flat(at(1), 1.0)];
        let incoming = vec![Bar::flat(at(2), 2.0), Bar::flat(at(3), 2.0)];
        let merged = merge_bars(&existing, &incoming);
        let ts: Vec<_> = merged.iter().map(|b| b.ts).collect();
        assert_eq!(ts, vec![at(1), at(2), at(3)]);
        assert!((merged[2].close - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn earliest_ignores_order() {
        let bars = vec![Bar::flat(at(5), 1.0), Bar::flat(at(2), 1.0)];
        assert_eq!(earliest_timestamp(&bars), Some(at(2)));
        assert_eq!(earliest_timestamp(&[]), None);
    }
}
