use std::sync::Arc;

use backfill::{
    BackfillError, ContractResolver, RangeDiscovery, RangeDiscoveryConfig, SymbolValidator,
    Timeframe, ValidatorConfig,
};
use backfill_mock::{DynamicMockController, ManualClock, MockBehavior, fixtures::daily_bars};

mod helpers;
use helpers::{EQUITY, MSFT, clock_at, connected_bridge, day};

struct Fixture {
    ranges: RangeDiscovery,
    validator: Arc<SymbolValidator>,
    clock: Arc<ManualClock>,
    ctl: DynamicMockController,
}

fn fixture() -> Fixture {
    let clock = clock_at(day(2024, 6, 1));
    let (bridge, ctl) = connected_bridge(30);
    ctl.accept(EQUITY, MSFT);
    let validator = Arc::new(SymbolValidator::with_clock(
        Arc::clone(&bridge),
        ValidatorConfig::default(),
        clock.clone(),
    ));
    let resolver: Arc<dyn ContractResolver> = validator.clone();
    let ranges = RangeDiscovery::new(bridge, resolver, RangeDiscoveryConfig::default())
        .with_clock(clock.clone());
    Fixture {
        ranges,
        validator,
        clock,
        ctl,
    }
}

#[test]
fn head_timestamp_answer_is_used_and_cached() {
    let f = fixture();
    f.ctl
        .set_head_behavior(MSFT, MockBehavior::Return(Some(day(2020, 1, 1))));

    assert_eq!(f.ranges.earliest(MSFT, Timeframe::H1), Some(day(2020, 1, 1)));
    assert!(f.ctl.fetch_log().is_empty());

    f.ctl.reset_logs();
    assert_eq!(f.ranges.earliest("msft", Timeframe::H1), Some(day(2020, 1, 1)));
    assert_eq!(f.ctl.remote_calls(), 0);
}

#[test]
fn discovered_earliest_is_written_to_the_symbol_record() {
    let f = fixture();
    f.ctl
        .set_head_behavior(MSFT, MockBehavior::Return(Some(day(1986, 3, 13))));

    f.ranges.earliest(MSFT, Timeframe::D1).unwrap();

    let rec = f.validator.cached(MSFT).unwrap();
    assert_eq!(rec.head_timestamps.get(&Timeframe::D1), Some(&day(1986, 3, 13)));
}

#[test]
fn range_ends_now() {
    let f = fixture();
    f.ctl
        .set_head_behavior(MSFT, MockBehavior::Return(Some(day(2020, 1, 1))));
    assert_eq!(
        f.ranges.range(MSFT, Timeframe::D1),
        Some((day(2020, 1, 1), day(2024, 6, 1)))
    );
}

#[test]
fn binary_search_finds_the_first_bar_without_head_timestamp() {
    let f = fixture();
    let start = day(2015, 3, 10);
    f.ctl.set_bar_series(MSFT, daily_bars(start, day(2024, 6, 1)));

    assert_eq!(f.ranges.earliest(MSFT, Timeframe::M5), Some(start));

    let log = f.ctl.fetch_log();
    assert!(!log.is_empty());
    assert!(log.len() <= 21);
    assert!(log.iter().all(|(_, req)| req.timeframe == Timeframe::D1));
    assert_eq!(f.ctl.head_calls(), 1);
}

#[test]
fn refused_head_query_falls_back_to_probing() {
    let f = fixture();
    let start = day(2010, 7, 19);
    f.ctl.set_head_behavior(
        MSFT,
        MockBehavior::Fail(BackfillError::remote(321, "head time stamp not available")),
    );
    f.ctl.set_bar_series(MSFT, daily_bars(start, day(2024, 6, 1)));

    assert_eq!(f.ranges.earliest(MSFT, Timeframe::D1), Some(start));
}

#[test]
fn no_data_anywhere_is_none_and_not_cached() {
    let f = fixture();

    assert!(f.ranges.earliest(MSFT, Timeframe::D1).is_none());
    assert_eq!(f.ranges.cache_stats().entries, 0);

    f.ctl.reset_logs();
    assert!(f.ranges.earliest(MSFT, Timeframe::D1).is_none());
    assert!(f.ctl.head_calls() > 0);
}

#[test]
fn connectivity_failure_stops_discovery() {
    let f = fixture();
    f.ctl.set_head_behavior(
        MSFT,
        MockBehavior::Fail(BackfillError::connection("socket closed")),
    );

    assert!(f.ranges.earliest(MSFT, Timeframe::D1).is_none());
    assert!(f.ctl.fetch_log().is_empty());
}

#[test]
fn throttled_history_request_is_not_read_as_missing_history() {
    let f = fixture();
    let start = day(2005, 3, 10);
    f.ctl.set_bar_series(MSFT, daily_bars(start, day(2024, 6, 1)));
    f.ctl.push_bars_behavior(
        MSFT,
        MockBehavior::Fail(BackfillError::PacingViolation { reset_in_ms: 1000 }),
    );

    assert!(f.ranges.earliest(MSFT, Timeframe::D1).is_none());
    assert!(f.ranges.get_cached_range(MSFT, Timeframe::D1).is_none());
    assert_eq!(f.ranges.cache_stats().entries, 0);
    let rec = f.validator.cached(MSFT).unwrap();
    assert!(rec.head_timestamps.get(&Timeframe::D1).is_none());

    assert_eq!(f.ranges.earliest(MSFT, Timeframe::D1), Some(start));
}

#[test]
fn remote_notice_during_search_stops_discovery() {
    let f = fixture();
    f.ctl.set_bar_series(MSFT, daily_bars(day(2012, 1, 2), day(2024, 6, 1)));
    f.ctl.push_bars_behavior(
        MSFT,
        MockBehavior::Fail(BackfillError::remote(366, "no market data permissions")),
    );

    assert!(f.ranges.earliest(MSFT, Timeframe::D1).is_none());
    assert_eq!(f.ctl.fetch_log().len(), 1);
    assert_eq!(f.ranges.cache_stats().entries, 0);
}

#[test]
fn injected_range_round_trips_until_it_expires() {
    let f = fixture();
    let (earliest, latest) = (day(2001, 2, 3), day(2024, 5, 31));
    f.ranges.cache_range("msft", Timeframe::H1, earliest, latest);

    assert_eq!(f.ranges.get_cached_range(MSFT, Timeframe::H1), Some((earliest, latest)));
    assert_eq!(f.ranges.earliest(MSFT, Timeframe::H1), Some(earliest));
    assert_eq!(f.ctl.remote_calls(), 0);

    f.clock.advance(chrono::Duration::hours(25));
    assert!(f.ranges.get_cached_range(MSFT, Timeframe::H1).is_none());
    let stats = f.ranges.cache_stats();
    assert_eq!((stats.entries, stats.fresh, stats.expired), (1, 0, 1));

    f.ranges.clear_cache();
    assert_eq!(f.ranges.cache_stats().entries, 0);
}

#[test]
fn ranges_report_failures_per_pair() {
    let f = fixture();
    f.ctl
        .set_head_behavior(MSFT, MockBehavior::Return(Some(day(2020, 1, 1))));

    let map = f
        .ranges
        .ranges(&["MSFT", "NOPE"], &[Timeframe::D1, Timeframe::H1]);

    assert_eq!(map.len(), 2);
    let msft = &map["MSFT"];
    assert_eq!(msft[&Timeframe::D1].map(|r| r.0), Some(day(2020, 1, 1)));
    assert_eq!(msft[&Timeframe::H1].map(|r| r.0), Some(day(2020, 1, 1)));
    let nope = &map["NOPE"];
    assert!(nope.values().all(Option::is_none));
    assert!(f.validator.is_known_failed("NOPE"));
}
