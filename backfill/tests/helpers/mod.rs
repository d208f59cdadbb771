// Shared fixtures so tests can `use helpers::*;`
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use backfill::{
    AllocatorConfig, AssetType, BridgeConfig, ClientId, ConnectionAllocator, SyncBridge,
};
use backfill_mock::{DynamicMockController, ManualClock, MockLinkFactory};
use chrono::{DateTime, TimeZone, Utc};

pub const MSFT: &str = "MSFT";
pub const EURUSD: &str = "EUR.USD";
pub const EQUITY: AssetType = AssetType::Equity;
pub const FOREX: AssetType = AssetType::Forex;
pub const FUTURE: AssetType = AssetType::Future;

/// Midnight UTC on the given date.
pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Bridge settings with short timeouts and retry delays.
pub fn bridge_config(id: i32) -> BridgeConfig {
    BridgeConfig {
        client_id: ClientId(id),
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(2),
        worker_timeout: Duration::from_secs(3),
        connect_retries: 3,
        retry_delay: Duration::from_millis(10),
        ..BridgeConfig::default()
    }
}

/// A fresh scripted terminal.
pub fn terminal() -> (Arc<MockLinkFactory>, DynamicMockController) {
    MockLinkFactory::new_with_controller()
}

/// A connected bridge on a fresh terminal.
pub fn connected_bridge(id: i32) -> (Arc<SyncBridge>, DynamicMockController) {
    let (factory, ctl) = terminal();
    let bridge = SyncBridge::connect(bridge_config(id), factory).unwrap();
    (Arc::new(bridge), ctl)
}

/// Allocator over a fresh terminal, with a frozen clock.
pub fn allocator_with_clock(
    clock: Arc<ManualClock>,
) -> (ConnectionAllocator, DynamicMockController) {
    let (factory, ctl) = terminal();
    let alloc = ConnectionAllocator::new(bridge_config(1), AllocatorConfig::default(), factory)
        .with_clock(clock);
    (alloc, ctl)
}

/// Frozen clock starting at `start`.
pub fn clock_at(start: DateTime<Utc>) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start))
}

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
