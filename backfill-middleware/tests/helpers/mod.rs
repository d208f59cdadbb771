#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use backfill_core::{
    AssetType, BarRequest, BrokerLink, ClientId, ConnectParams, Contract, ContractSpec, Timeframe,
    WhatToShow,
};
use chrono::{TimeZone, Utc};

pub fn params(id: i32) -> ConnectParams {
    ConnectParams {
        host: "127.0.0.1".into(),
        port: 7497,
        client_id: ClientId(id),
        timeout: Duration::from_secs(1),
        readonly: true,
    }
}

pub async fn msft(link: &Arc<dyn BrokerLink>) -> Contract {
    link.qualify(&ContractSpec::equity("MSFT", "SMART", "USD"))
        .await
        .unwrap()
        .unwrap()
}

pub fn day_request() -> BarRequest {
    BarRequest::between(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        Timeframe::H1,
        WhatToShow::Trades,
        false,
    )
}

pub const EQUITY: AssetType = AssetType::Equity;
