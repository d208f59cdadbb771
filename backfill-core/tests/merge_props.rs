use backfill_core::{Bar, earliest_timestamp, merge_bars};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn arb_ts() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..2_000_000_000i64).prop_map(|s| DateTime::from_timestamp(s, 0).unwrap())
}

fn arb_bar() -> impl Strategy<Value = Bar> {
    (arb_ts(), 1u32..100_000u32).prop_map(|(ts, px)| Bar::flat(ts, f64::from(px) / 100.0))
}

proptest! {
    #[test]
    fn merged_bars_are_sorted_and_unique(
        existing in proptest::collection::vec(arb_bar(), 0..100),
        incoming in proptest::collection::vec(arb_bar(), 0..100),
    ) {
        let merged = merge_bars(&existing, &incoming);
        for w in merged.windows(2) {
            prop_assert!(w[0].ts < w[1].ts);
        }
        let expected: BTreeSet<_> = existing.iter().chain(&incoming).map(|b| b.ts).collect();
        let got: BTreeSet<_> = merged.iter().map(|b| b.ts).collect();
        prop_assert_eq!(expected, got);
    }

    #[test]
    fn incoming_bar_wins_on_collision(
        incoming in proptest::collection::vec(arb_bar(), 1..50),
    ) {
        let stale: Vec<Bar> = incoming.iter().map(|b| Bar::flat(b.ts, -1.0)).collect();
        let merged = merge_bars(&stale, &incoming);
        prop_assert!(merged.iter().all(|b| b.close >= 0.0));
    }

    #[test]
    fn earliest_matches_first_merged(
        bars in proptest::collection::vec(arb_bar(), 1..100),
    ) {
        let merged = merge_bars(&[], &bars);
        prop_assert_eq!(earliest_timestamp(&bars), merged.first().map(|b| b.ts));
    }
}
