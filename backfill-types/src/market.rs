//! Closed vocabularies shared by every crate: timeframes, asset classes,
//! connection purposes and client identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackfillError;

/// Bar timeframe understood by the remote terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// One-minute bars.
    #[serde(rename = "1m")]
    M1,
    /// Five-minute bars.
    #[serde(rename = "5m")]
    M5,
    /// Fifteen-minute bars.
    #[serde(rename = "15m")]
    M15,
    /// Thirty-minute bars.
    #[serde(rename = "30m")]
    M30,
    /// Hourly bars.
    #[serde(rename = "1h")]
    H1,
    /// Four-hour bars.
    #[serde(rename = "4h")]
    H4,
    /// Daily bars.
    #[serde(rename = "1d")]
    D1,
    /// Weekly bars.
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// Every supported timeframe, finest first.
    pub const ALL: [Self; 8] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    /// Short label used in cache keys and file names (`"1h"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Bar-size string as the remote terminal expects it.
    #[must_use]
    pub const fn bar_size(self) -> &'static str {
        match self {
            Self::M1 => "1 min",
            Self::M5 => "5 mins",
            Self::M15 => "15 mins",
            Self::M30 => "30 mins",
            Self::H1 => "1 hour",
            Self::H4 => "4 hours",
            Self::D1 => "1 day",
            Self::W1 => "1 week",
        }
    }

    /// Largest span, in days, a single historical request should cover.
    ///
    /// The terminal rejects or truncates requests whose bar count is too large,
    /// so finer timeframes get shorter request windows.
    #[must_use]
    pub const fn max_request_days(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 7,
            Self::M15 => 14,
            Self::M30 | Self::H1 => 30,
            Self::H4 => 180,
            Self::D1 => 365,
            Self::W1 => 3650,
        }
    }

    /// Nominal bar length in seconds.
    #[must_use]
    pub const fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        let tf = match norm.as_str() {
            "1m" | "1min" | "1 min" => Self::M1,
            "5m" | "5min" | "5 mins" => Self::M5,
            "15m" | "15min" | "15 mins" => Self::M15,
            "30m" | "30min" | "30 mins" => Self::M30,
            "1h" | "60m" | "1 hour" => Self::H1,
            "4h" | "240m" | "4 hours" => Self::H4,
            "1d" | "d" | "daily" | "1 day" => Self::D1,
            "1w" | "w" | "weekly" | "1 week" => Self::W1,
            _ => {
                return Err(BackfillError::validation(format!(
                    "unsupported timeframe '{s}'"
                )));
            }
        };
        Ok(tf)
    }
}

/// Asset class a ticker resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    /// Foreign exchange pair.
    Forex,
    /// Listed equity.
    Equity,
    /// Exchange-traded future (continuous front month).
    Future,
}

impl AssetType {
    /// Resolution order used by the symbol validator.
    pub const RESOLUTION_ORDER: [Self; 3] = [Self::Forex, Self::Equity, Self::Future];

    /// Security-type code the terminal uses for this asset class.
    #[must_use]
    pub const fn sec_type(self) -> &'static str {
        match self {
            Self::Forex => "CASH",
            Self::Equity => "STK",
            Self::Future => "CONTFUT",
        }
    }

    /// Price series the terminal serves historical bars from for this class.
    #[must_use]
    pub const fn what_to_show(self) -> WhatToShow {
        match self {
            Self::Forex => WhatToShow::Midpoint,
            Self::Equity | Self::Future => WhatToShow::Trades,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forex => "forex",
            Self::Equity => "equity",
            Self::Future => "future",
        })
    }
}

/// Which price series a historical request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WhatToShow {
    /// Executed trades.
    #[default]
    Trades,
    /// Bid/ask midpoint; the only series available for spot FX.
    Midpoint,
    /// Best bid.
    Bid,
    /// Best ask.
    Ask,
}

impl WhatToShow {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "TRADES",
            Self::Midpoint => "MIDPOINT",
            Self::Bid => "BID",
            Self::Ask => "ASK",
        }
    }
}

/// Numeric client identity of one open connection to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub i32);

impl ClientId {
    /// Returns the raw identity value.
    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Identity shifted by `offset`, saturating at the numeric bounds.
    #[must_use]
    pub const fn offset(self, offset: i32) -> Self {
        Self(self.0.saturating_add(offset))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared reason a caller needs a connection.
///
/// The purpose decides whether the caller shares a long-lived connection or
/// receives a fresh short-lived one with its own identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Interactive API serving; one process-wide connection.
    ApiCall,
    /// Background gap filling; one dedicated connection.
    GapFiller,
    /// Symbol validation; one dedicated connection.
    SymbolValidation,
    /// Data manager fetches; one dedicated connection.
    DataManager,
    /// Batch jobs; one connection per batch id.
    Batch,
    /// CLI one-shots; one connection per call.
    Cli,
    /// Tests; one connection per call.
    Test,
}

impl Purpose {
    /// Every purpose, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::ApiCall,
        Self::GapFiller,
        Self::SymbolValidation,
        Self::DataManager,
        Self::Batch,
        Self::Cli,
        Self::Test,
    ];

    /// Stable label used as a key prefix and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiCall => "api_call",
            Self::GapFiller => "gap_filler",
            Self::SymbolValidation => "symbol_validation",
            Self::DataManager => "data_manager",
            Self::Batch => "batch",
            Self::Cli => "cli",
            Self::Test => "test",
        }
    }

    /// Short-lived purposes tracked in the allocator's temporary set.
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        matches!(self, Self::Batch | Self::Cli | Self::Test)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_aliases() {
        assert_eq!("1H".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert_eq!(" daily ".parse::<Timeframe>().unwrap(), Timeframe::D1);
        assert_eq!("5 mins".parse::<Timeframe>().unwrap(), Timeframe::M5);
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_display_matches_serde() {
        for tf in Timeframe::ALL {
            let json = serde_json::to_string(&tf).unwrap();
            assert_eq!(json, format!("\"{tf}\""));
        }
    }

    #[test]
    fn only_batch_cli_test_are_temporary() {
        let temp: Vec<Purpose> = Purpose::ALL
            .into_iter()
            .filter(|p| p.is_temporary())
            .collect();
        assert_eq!(temp, vec![Purpose::Batch, Purpose::Cli, Purpose::Test]);
    }

    #[test]
    fn forex_uses_midpoint() {
        assert_eq!(AssetType::Forex.what_to_show(), WhatToShow::Midpoint);
        assert_eq!(AssetType::Equity.what_to_show(), WhatToShow::Trades);
    }
}
