//! Request and response shapes exchanged with a `BrokerLink`, plus re-exports
//! of the shared vocabulary from `backfill-types`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use backfill_types::{
    AllocatorConfig, AllocatorStatus, AssetType, BackfillConfig, BackfillError, BridgeConfig,
    ClientId, ConnectionInfo, IdentityRange, PacingConfig, PacingMode, Purpose, RangeCacheStats,
    RangeDiscoveryConfig, SessionConfig, Timeframe, ValidatorConfig, ValidatorStats, WhatToShow,
};

/// Parameters for opening one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Terminal host.
    pub host: String,
    /// Terminal port.
    pub port: u16,
    /// Identity to open the link under.
    pub client_id: ClientId,
    /// Connect deadline.
    pub timeout: Duration,
    /// Open read-only.
    pub readonly: bool,
}

impl ConnectParams {
    /// Derive connect parameters from a bridge configuration.
    #[must_use]
    pub fn from_bridge(cfg: &BridgeConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            client_id: cfg.client_id,
            timeout: cfg.connect_timeout,
            readonly: cfg.readonly,
        }
    }
}

/// What the validator asks the terminal to qualify.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Root symbol (`"EUR"` for EUR.USD, `"MSFT"`, `"ES"`).
    pub symbol: String,
    /// Asset class of the candidate.
    pub asset_type: AssetType,
    /// Venue.
    pub exchange: String,
    /// Quote currency.
    pub currency: String,
    /// Full local symbol where the class needs one (`"EUR.USD"` for FX).
    pub local_symbol: Option<String>,
}

impl ContractSpec {
    /// Spot FX pair `base.quote`.
    pub fn forex(base: &str, quote: &str, exchange: impl Into<String>) -> Self {
        Self {
            symbol: base.to_string(),
            asset_type: AssetType::Forex,
            exchange: exchange.into(),
            currency: quote.to_string(),
            local_symbol: Some(format!("{base}.{quote}")),
        }
    }

    /// Listed equity.
    pub fn equity(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            asset_type: AssetType::Equity,
            exchange: exchange.into(),
            currency: currency.into(),
            local_symbol: None,
        }
    }

    /// Continuous future.
    pub fn future(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            asset_type: AssetType::Future,
            exchange: exchange.into(),
            currency: currency.into(),
            local_symbol: None,
        }
    }

    /// Security-type code for the candidate's asset class.
    #[must_use]
    pub const fn sec_type(&self) -> &'static str {
        self.asset_type.sec_type()
    }
}

/// A contract the terminal has qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    /// Terminal-assigned contract id.
    pub con_id: i64,
    /// Root symbol.
    pub symbol: String,
    /// Local symbol as reported by the terminal.
    pub local_symbol: Option<String>,
    /// Asset class.
    pub asset_type: AssetType,
    /// Venue.
    pub exchange: String,
    /// Quote currency.
    pub currency: String,
    /// Long name, when the terminal supplies one.
    pub description: Option<String>,
}

/// One historical-bars request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarRequest {
    /// End of the requested window (exclusive).
    pub end: DateTime<Utc>,
    /// Window length in whole days, counted back from `end`.
    pub span_days: i64,
    /// Bar size.
    pub timeframe: Timeframe,
    /// Price series.
    pub what_to_show: WhatToShow,
    /// Regular trading hours only.
    pub use_rth: bool,
}

impl BarRequest {
    /// Request covering `[start, end)` at the given timeframe; the span is
    /// rounded up to whole days and is at least one day.
    #[must_use]
    pub fn between(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Self {
        let secs = (end - start).num_seconds().max(1);
        let span_days = ((secs + 86_399) / 86_400).max(1);
        Self {
            end,
            span_days,
            timeframe,
            what_to_show,
            use_rth,
        }
    }

    /// Start of the requested window.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.end - chrono::Duration::days(self.span_days)
    }

    /// Duration string in the terminal's syntax (`"7 D"`, `"2 Y"`).
    ///
    /// The terminal refuses day counts above one year, so longer spans are
    /// expressed in whole years rounded up.
    #[must_use]
    pub fn duration_str(&self) -> String {
        if self.span_days > 365 {
            let years = (self.span_days + 364) / 365;
            format!("{years} Y")
        } else {
            format!("{} D", self.span_days)
        }
    }
}

/// Out-of-band notice delivered on a link's side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Numeric notice code.
    pub code: i32,
    /// Notice text.
    pub message: String,
    /// Request the notice refers to, if any.
    pub request_id: Option<i64>,
    /// Arrival instant.
    pub received_at: DateTime<Utc>,
}

impl ErrorNotice {
    /// Build a notice stamped with `received_at`.
    pub fn new(code: i32, message: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            received_at,
        }
    }
}
