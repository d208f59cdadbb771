use std::time::Duration;

use backfill::{
    BackfillError, BarRequest, BridgeState, ClientId, ContractSpec, ExecContext, SyncBridge,
    Timeframe, WhatToShow,
};
use backfill_mock::MockBehavior;

mod helpers;
use helpers::{EQUITY, MSFT, bridge_config, connected_bridge, day, terminal};

fn msft_spec() -> ContractSpec {
    ContractSpec::equity(MSFT, "SMART", "USD")
}

fn week_request() -> BarRequest {
    BarRequest::between(day(2024, 1, 1), day(2024, 1, 8), Timeframe::H1, WhatToShow::Trades, false)
}

#[test]
fn connect_retries_until_the_terminal_accepts() {
    let (factory, ctl) = terminal();
    ctl.fail_next_connects(2);

    let bridge = SyncBridge::connect(bridge_config(7), factory).unwrap();

    assert!(bridge.is_connected());
    assert_eq!(ctl.connect_attempts(), vec![ClientId(7); 3]);
    assert_eq!(ctl.open_client_ids(), vec![ClientId(7)]);
}

#[test]
fn connect_gives_up_after_configured_attempts() {
    let (factory, ctl) = terminal();
    ctl.refuse_connects(true);

    let err = SyncBridge::connect(bridge_config(7), factory).err().unwrap();

    assert!(matches!(err, BackfillError::Connection(_)));
    assert_eq!(ctl.connect_attempts().len(), 3);
}

#[test]
fn ensure_connected_is_a_no_op_when_connected() {
    let (bridge, ctl) = connected_bridge(3);
    assert!(bridge.ensure_connected());
    assert!(bridge.ensure_connected());
    assert_eq!(ctl.links_created(), 1);
    assert_eq!(bridge.state(), BridgeState::Connected);
}

#[test]
fn ensure_connected_reopens_a_dropped_link() {
    let (bridge, ctl) = connected_bridge(3);
    ctl.drop_all_connections();
    assert!(!bridge.is_connected());

    assert!(bridge.ensure_connected());
    assert_eq!(ctl.links_created(), 2);
    assert_eq!(ctl.open_client_ids(), vec![ClientId(3)]);
}

#[test]
fn disconnect_is_idempotent() {
    let (bridge, ctl) = connected_bridge(4);
    bridge.disconnect();
    bridge.disconnect();
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    assert!(ctl.open_client_ids().is_empty());
}

#[test]
fn calls_reconnect_a_disconnected_bridge() {
    let (bridge, ctl) = connected_bridge(4);
    ctl.accept(EQUITY, MSFT);
    bridge.disconnect();

    let contract = bridge.qualify(ExecContext::Blocking, &msft_spec()).unwrap();
    assert!(contract.is_some());
    assert!(bridge.is_connected());
}

#[test]
fn stalled_call_times_out() {
    let (factory, ctl) = terminal();
    ctl.set_qualify_behavior(EQUITY, MSFT, MockBehavior::Hang);
    let cfg = backfill::BridgeConfig {
        call_timeout: Duration::from_millis(150),
        ..bridge_config(9)
    };
    let bridge = SyncBridge::connect(cfg, factory).unwrap();

    let err = bridge.qualify(ExecContext::Blocking, &msft_spec()).unwrap_err();
    assert!(matches!(err, BackfillError::Timeout { .. }));
    assert!(bridge.is_connected());
}

#[test]
fn informational_notices_do_not_fail_calls() {
    let (bridge, ctl) = connected_bridge(5);
    ctl.accept(EQUITY, MSFT);
    ctl.inject_notice(2104, "Market data farm connection is OK:usfarm");
    ctl.inject_notice(2106, "HMDS data farm connection is OK:ushmds");

    let contract = bridge.qualify(ExecContext::Blocking, &msft_spec()).unwrap();
    assert_eq!(contract.map(|c| c.symbol), Some(MSFT.to_string()));
}

#[test]
fn historical_error_notice_fails_the_fetch() {
    let (bridge, ctl) = connected_bridge(5);
    ctl.accept(EQUITY, MSFT);
    let contract = bridge
        .qualify(ExecContext::Blocking, &msft_spec())
        .unwrap()
        .unwrap();
    ctl.inject_notice_on_fetch(162, "Historical Market Data Service error message:HMDS query returned no data");

    let err = bridge
        .fetch_bars(ExecContext::Blocking, &contract, &week_request())
        .unwrap_err();
    assert!(matches!(err, BackfillError::Data(_)));
    assert!(bridge.is_connected());
}

#[test]
fn connectivity_notice_marks_the_bridge_disconnected() {
    let (bridge, ctl) = connected_bridge(6);
    ctl.accept(EQUITY, MSFT);
    let contract = bridge
        .qualify(ExecContext::Blocking, &msft_spec())
        .unwrap()
        .unwrap();
    ctl.inject_notice_on_fetch(1100, "Connectivity between IB and TWS has been lost");

    let err = bridge
        .fetch_bars(ExecContext::Blocking, &contract, &week_request())
        .unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    assert!(ctl.open_client_ids().is_empty());

    // The next call opens a fresh link.
    bridge
        .fetch_bars(ExecContext::Blocking, &contract, &week_request())
        .unwrap();
    assert_eq!(ctl.links_created(), 2);
}

#[tokio::test]
async fn runtime_callers_use_an_offset_throwaway_identity() {
    let (factory, ctl) = terminal();
    ctl.accept(EQUITY, MSFT);
    let bridge = SyncBridge::connect(bridge_config(5), factory).unwrap();

    let first = bridge.qualify(ExecContext::InsideRuntime, &msft_spec()).unwrap();
    let second = bridge.qualify(ExecContext::InsideRuntime, &msft_spec()).unwrap();

    assert!(first.is_some() && second.is_some());
    let attempts = ctl.connect_attempts();
    assert_eq!(attempts, vec![ClientId(5), ClientId(1005), ClientId(1006)]);
    // Throwaway links are closed; only the primary identity stays open.
    assert_eq!(ctl.open_client_ids(), vec![ClientId(5)]);
    bridge.disconnect();
}

#[test]
fn throwaway_worker_times_out() {
    let (factory, ctl) = terminal();
    ctl.set_qualify_behavior(EQUITY, MSFT, MockBehavior::Hang);
    let cfg = backfill::BridgeConfig {
        worker_timeout: Duration::from_millis(200),
        ..bridge_config(8)
    };
    let bridge = SyncBridge::connect(cfg, factory).unwrap();

    let err = bridge
        .qualify(ExecContext::InsideRuntime, &msft_spec())
        .unwrap_err();
    assert!(matches!(err, BackfillError::Timeout { .. }));
}
