//! Backfill-specific error taxonomy, configuration primitives and report envelopes.
#![warn(missing_docs)]

mod config;
mod error;
mod market;
mod reports;

pub use config::{
    AllocatorConfig, BackfillConfig, BridgeConfig, IdentityRange, PacingConfig, PacingMode,
    RangeDiscoveryConfig, SessionConfig, ValidatorConfig,
};
pub use error::BackfillError;
pub use market::{AssetType, ClientId, Purpose, Timeframe, WhatToShow};
pub use reports::{AllocatorStatus, ConnectionInfo, RangeCacheStats, ValidatorStats};
