use std::sync::Arc;

use backfill::{
    AssetType, BackfillError, ContractResolver, SymbolValidator, Timeframe, ValidatorConfig,
};
use backfill_mock::{DynamicMockController, ManualClock, MockBehavior};

mod helpers;
use helpers::{EQUITY, EURUSD, FOREX, FUTURE, MSFT, clock_at, connected_bridge, day};

fn validator_at(
    clock: Arc<ManualClock>,
    config: ValidatorConfig,
) -> (SymbolValidator, DynamicMockController) {
    let (bridge, ctl) = connected_bridge(20);
    (SymbolValidator::with_clock(bridge, config, clock), ctl)
}

fn validator() -> (SymbolValidator, DynamicMockController) {
    validator_at(clock_at(day(2024, 1, 1)), ValidatorConfig::default())
}

#[test]
fn forex_pair_is_tried_first_and_stops_there() {
    let (v, ctl) = validator();
    ctl.accept(FOREX, EURUSD);
    ctl.accept(EQUITY, EURUSD);

    let rec = v.resolve("EUR.USD").unwrap();

    assert_eq!(rec.asset_type, AssetType::Forex);
    assert_eq!(rec.exchange, "IDEALPRO");
    assert_eq!(rec.currency, "USD");
    let log = ctl.qualify_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].asset_type, AssetType::Forex);
}

#[test]
fn spellings_of_one_pair_share_a_cache_entry() {
    let (v, ctl) = validator();
    ctl.accept(FOREX, EURUSD);

    assert!(v.is_valid("EUR/USD"));
    assert!(v.is_valid("eur.usd"));
    assert!(v.is_valid("  EUR.USD "));
    assert_eq!(ctl.qualify_log().len(), 1);
}

#[test]
fn six_letter_pairs_are_split_three_three() {
    let (v, ctl) = validator();
    ctl.accept(FOREX, "GBP.JPY");
    let rec = v.resolve("gbpjpy").unwrap();
    assert_eq!(rec.asset_type, AssetType::Forex);
    assert_eq!(rec.requested_symbol, "GBPJPY");
    assert_eq!(ctl.qualify_log()[0].local_symbol.as_deref(), Some("GBP.JPY"));
}

#[test]
fn equities_and_futures_follow_in_order() {
    let (v, ctl) = validator();
    ctl.accept(EQUITY, MSFT);
    ctl.accept(FUTURE, "ES");

    assert_eq!(v.resolve(MSFT).unwrap().asset_type, AssetType::Equity);
    assert_eq!(v.resolve("es").unwrap().asset_type, AssetType::Future);

    let types: Vec<_> = ctl.qualify_log().iter().map(|s| s.asset_type).collect();
    assert_eq!(
        types,
        vec![AssetType::Equity, AssetType::Equity, AssetType::Future]
    );
}

#[test]
fn unknown_symbols_fail_once_and_stay_failed() {
    let (v, ctl) = validator();

    assert!(v.resolve("NOPE").is_none());
    let calls = ctl.qualify_log().len();
    assert_eq!(calls, 2);
    assert!(v.is_known_failed("nope"));

    assert!(!v.is_valid("NOPE"));
    assert_eq!(ctl.qualify_log().len(), calls);

    ctl.accept(EQUITY, "NOPE");
    v.clear_failed();
    assert!(v.is_valid("NOPE"));
    assert!(!v.is_known_failed("NOPE"));
}

#[test]
fn connectivity_loss_is_not_invalidity() {
    let (v, ctl) = validator();
    ctl.set_qualify_behavior(EQUITY, "XYZ", MockBehavior::Fail(BackfillError::connection("down")));

    assert!(v.resolve("XYZ").is_none());
    assert!(!v.is_known_failed("XYZ"));

    ctl.set_qualify_behavior(
        EQUITY,
        "XYZ",
        MockBehavior::Return(Some(backfill::Contract {
            con_id: 1,
            symbol: "XYZ".into(),
            local_symbol: None,
            asset_type: AssetType::Equity,
            exchange: "SMART".into(),
            currency: "USD".into(),
            description: None,
        })),
    );
    assert!(v.is_valid("XYZ"));
}

#[test]
fn validated_symbols_never_become_failed() {
    let clock = clock_at(day(2024, 1, 1));
    let (v, ctl) = validator_at(Arc::clone(&clock), ValidatorConfig::default());
    ctl.accept(EQUITY, MSFT);
    let first = v.resolve(MSFT).unwrap();

    // Expired record, terminal unreachable: keep the last good record.
    clock.advance(chrono::Duration::days(31));
    ctl.set_qualify_behavior(EQUITY, MSFT, MockBehavior::Fail(BackfillError::connection("down")));
    let stale = v.resolve(MSFT).unwrap();
    assert_eq!(stale.validated_at, first.validated_at);

    // Terminal answers "unknown" for every candidate: still validated.
    ctl.set_qualify_behavior(EQUITY, MSFT, MockBehavior::Return(None));
    assert!(v.is_valid(MSFT));
    assert!(v.is_known_valid(MSFT));
    assert!(!v.is_known_failed(MSFT));

    let stats = v.stats();
    assert_eq!((stats.validated, stats.failed), (1, 0));
    assert_eq!(stats.expired_records, 1);
}

#[test]
fn expired_record_is_refreshed_when_reachable() {
    let clock = clock_at(day(2024, 1, 1));
    let (v, ctl) = validator_at(Arc::clone(&clock), ValidatorConfig::default());
    ctl.accept(EQUITY, MSFT);
    v.resolve(MSFT).unwrap();

    clock.advance(chrono::Duration::days(31));
    let refreshed = v.resolve(MSFT).unwrap();
    assert_eq!(refreshed.validated_at, clock_now(&clock));
    assert_eq!(ctl.qualify_log().len(), 2);
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    use backfill::Clock;
    clock.now()
}

#[test]
fn batches_report_per_symbol_results() {
    let (v, ctl) = validator();
    ctl.accept(EQUITY, MSFT);
    ctl.accept(FOREX, EURUSD);

    let valid = v.validate_batch(&["MSFT", "eur/usd", "BOGUS"]);
    assert_eq!(valid.get("MSFT"), Some(&true));
    assert_eq!(valid.get("eur/usd"), Some(&true));
    assert_eq!(valid.get("BOGUS"), Some(&false));

    let resolved = v.resolve_batch(&["MSFT", "BOGUS"]);
    assert_eq!(
        resolved.get("MSFT").and_then(|r| r.as_ref()).map(|r| r.asset_type),
        Some(AssetType::Equity)
    );
    assert!(resolved.get("BOGUS").unwrap().is_none());
}

#[test]
fn cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ValidatorConfig {
        cache_path: Some(dir.path().join("symbol_cache.json")),
        ..ValidatorConfig::default()
    };
    let clock = clock_at(day(2024, 1, 1));
    {
        let (v, ctl) = validator_at(Arc::clone(&clock), cfg.clone());
        ctl.accept(EQUITY, MSFT);
        assert!(v.is_valid(MSFT));
        assert!(!v.is_valid("NOPE"));
        v.remember_head_timestamp(MSFT, Timeframe::D1, day(1986, 3, 13));
    }

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("symbol_cache.json")).unwrap())
            .unwrap();
    assert_eq!(raw["validated_symbols"], serde_json::json!(["MSFT"]));
    assert_eq!(raw["failed_symbols"], serde_json::json!(["NOPE"]));
    assert!(raw["cache"]["MSFT"].get("contract").is_none());
    assert!(raw["last_updated"].is_string());

    let (v, ctl) = validator_at(clock, cfg);
    let rec = v.resolve(MSFT).unwrap();
    assert!(rec.contract.is_none());
    assert_eq!(rec.head_timestamps.get(&Timeframe::D1), Some(&day(1986, 3, 13)));
    assert!(v.is_known_failed("NOPE"));
    assert!(ctl.qualify_log().is_empty());

    // A live handle is rebuilt with one targeted lookup.
    ctl.accept(EQUITY, MSFT);
    let contract = v.contract_for(MSFT).unwrap().unwrap();
    assert_eq!(contract.asset_type, AssetType::Equity);
    assert_eq!(ctl.qualify_log().len(), 1);
    v.contract_for(MSFT).unwrap().unwrap();
    assert_eq!(ctl.qualify_log().len(), 1);
}

#[test]
fn expired_records_are_dropped_on_load_but_stay_validated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ValidatorConfig {
        cache_path: Some(dir.path().join("cache.json")),
        ..ValidatorConfig::default()
    };
    {
        let (v, ctl) = validator_at(clock_at(day(2024, 1, 1)), cfg.clone());
        ctl.accept(EQUITY, MSFT);
        assert!(v.is_valid(MSFT));
    }

    let (v, _ctl) = validator_at(clock_at(day(2024, 3, 1)), cfg);
    assert!(v.cached(MSFT).is_none());
    assert!(v.is_known_valid(MSFT));
    assert_eq!(v.stats().cached_records, 0);
}

#[test]
fn validated_symbol_without_a_record_stays_valid_while_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ValidatorConfig {
        cache_path: Some(dir.path().join("cache.json")),
        ..ValidatorConfig::default()
    };
    {
        let (v, ctl) = validator_at(clock_at(day(2024, 1, 1)), cfg.clone());
        ctl.accept(EQUITY, MSFT);
        assert!(v.is_valid(MSFT));
    }

    let (v, ctl) = validator_at(clock_at(day(2024, 3, 1)), cfg);
    ctl.refuse_connects(true);
    ctl.drop_all_connections();

    assert!(v.cached(MSFT).is_none());
    assert!(v.is_valid(MSFT));
    assert!(!v.is_known_failed(MSFT));
    assert!(!v.is_valid("NOPE"));
    assert!(!v.is_known_failed("NOPE"));
}

#[test]
fn clear_cache_forgets_everything() {
    let (v, ctl) = validator();
    ctl.accept(EQUITY, MSFT);
    assert!(v.is_valid(MSFT));
    assert!(!v.is_valid("NOPE"));

    v.clear_cache();
    let stats = v.stats();
    assert_eq!((stats.validated, stats.failed, stats.cached_records), (0, 0, 0));
}
