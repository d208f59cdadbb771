//! Backfill turns a connection-limited, callback-driven broker terminal into a
//! dependable batch source of historical bars.
//!
//! Overview
//! - `SyncBridge` wraps one terminal link behind blocking calls. It owns a
//!   private runtime for the lifetime of the link and filters the terminal's
//!   informational notices from true errors.
//! - `ConnectionAllocator` hands out bridges by declared `Purpose`. Dedicated
//!   purposes share one long-lived connection each; batch, CLI and test callers
//!   get fresh identities from their own ranges.
//! - `SymbolValidator` resolves tickers to contracts (forex, then equity, then
//!   future) and persists which symbols ever validated.
//! - `RangeDiscovery` finds the earliest bar per symbol and timeframe and caches
//!   it for a day.
//! - `SessionManager` splits long ranges into chunks, persists progress after
//!   every chunk and resumes after restarts.
//!
//! Key behaviors and trade-offs
//! - Identity scarcity: reusing a connected entry is always preferred over
//!   opening a new one, because the terminal caps concurrent identities.
//! - Connectivity is not invalidity: a validated symbol stays validated when the
//!   terminal cannot be reached.
//! - Cancellation is cooperative: an in-flight chunk fetch finishes, the next
//!   one does not start.
//! - Execution context is explicit: callers already on a cooperative executor
//!   pass `ExecContext::InsideRuntime` and their calls run on a throwaway worker
//!   with an offset identity.
//!
//! Examples
//! ```rust,ignore
//! use std::sync::Arc;
//! use backfill::{Backfill, PacingConfig, Timeframe};
//!
//! let backfill = Backfill::builder()
//!     .with_link_factory(Arc::new(TerminalFactory::new()))
//!     .host("127.0.0.1")
//!     .port(7497)
//!     .data_dir("./state")
//!     .pacing(PacingConfig::default())
//!     .build()?;
//!
//! let start = "2024-01-01T00:00:00Z".parse()?;
//! let end = "2024-03-01T00:00:00Z".parse()?;
//! let (session_id, complete) = backfill.download("MSFT", Timeframe::H1, start, end)?;
//! if !complete {
//!     println!("{:?}", backfill.sessions().status(&session_id));
//! }
//! ```
//!
//! Using the components standalone:
//! ```rust,ignore
//! use std::sync::Arc;
//! use backfill::{ConnectionAllocator, Purpose, SymbolValidator, ValidatorConfig};
//!
//! let allocator = ConnectionAllocator::new(bridge_cfg, alloc_cfg, factory);
//! let conn = allocator.acquire(Purpose::SymbolValidation, None)?;
//! let validator = SymbolValidator::new(conn.bridge.clone(), ValidatorConfig::default());
//! assert!(validator.is_valid("eur/usd"));
//! ```
#![warn(missing_docs)]

/// Purpose-based connection allocation.
pub mod allocator;
/// Blocking bridge over one terminal link.
pub mod bridge;
pub(crate) mod core;
/// Bridge-backed bar fetcher for sessions.
pub mod fetcher;
/// Earliest-data discovery.
pub mod range;
/// Resumable chunked downloads.
pub mod session;
/// Symbol to contract resolution.
pub mod validator;

pub use allocator::{
    API_SINGLETON_KEY, BridgeSource, ConnectionAllocator, ConnectionLease, ManagedConnection,
    UpstreamConnections,
};
pub use bridge::{BridgeState, ExecContext, SyncBridge};
pub use core::{Backfill, BackfillBuilder};
pub use fetcher::BridgeFetcher;
pub use range::{RangeCacheEntry, RangeDiscovery, RangeMap};
pub use session::{
    BarFetcher, ChunkProgress, ChunkStatus, DownloadChunk, DownloadSession, SessionManager,
    SessionStatus, SessionSummary, split_range,
};
pub use validator::{ContractRecord, ContractResolver, SymbolValidator, normalize_symbol};

pub use backfill_middleware::{CooldownMiddleware, LinkBuilder, PacedLinkFactory, PacingMiddleware};

// Re-export core types for convenience
pub use backfill_core::{
    AllocatorConfig, AllocatorStatus, AssetType, BackfillConfig, BackfillError, Bar, BarRequest,
    BridgeConfig, BrokerLink, ClientId, Clock, ConnectParams, ConnectionInfo, Contract,
    ContractSpec, ErrorNotice, IdentityRange, LinkFactory, LocalStore, PacingConfig, PacingMode,
    Purpose, RangeCacheStats, RangeDiscoveryConfig, SessionConfig, SystemClock, Timeframe,
    ValidatorConfig, ValidatorStats, WhatToShow,
};
