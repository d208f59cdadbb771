//! Deterministic bar series for tests.

use backfill_core::Bar;
use chrono::{DateTime, Duration, Utc};

/// One bar every `step` from `start` (inclusive) to `end` (exclusive).
///
/// Prices climb by one cent per bar so ordering mistakes are visible.
#[must_use]
pub fn bars_between(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<Bar> {
    let mut out = Vec::new();
    if step <= Duration::zero() {
        return out;
    }
    let mut ts = start;
    let mut px = 100.0;
    while ts < end {
        out.push(Bar {
            ts,
            open: px,
            high: px + 0.5,
            low: px - 0.5,
            close: px + 0.01,
            volume: 1_000.0,
        });
        ts += step;
        px += 0.01;
    }
    out
}

/// Daily bars over `[start, end)`.
#[must_use]
pub fn daily_bars(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bar> {
    bars_between(start, end, Duration::days(1))
}
