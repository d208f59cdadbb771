//! backfill-core
//!
//! Core traits, types, and helpers shared across the backfill workspace.
//!
//! - `link`: the `BrokerLink` capability (one physical terminal connection) and
//!   the `LinkFactory` that produces fresh links.
//! - `types`: contracts, contract specs, bar requests and error notices.
//! - `bar`: OHLCV bars and the merge helper used when writing through to a store.
//! - `notice`: classification of out-of-band terminal notices.
//! - `persist`: atomic JSON state files.
//! - `store` / `clock`: the local bar store and time source seams.
//!
//! Async runtime (Tokio)
//! ---------------------
//! `BrokerLink` is an async trait because the terminal protocol is
//! callback-driven. Links are expected to be driven from a Tokio 1.x runtime;
//! the `backfill` crate owns that runtime and exposes blocking calls on top.
#![warn(missing_docs)]

/// OHLCV bars and merge helpers.
pub mod bar;
/// Time source seam.
pub mod clock;
/// The `BrokerLink` capability and link factories.
pub mod link;
/// Middleware trait implemented by link wrappers.
pub mod middleware;
/// Classification of out-of-band notices.
pub mod notice;
/// Atomic JSON state files.
pub mod persist;
/// Local bar store seam.
pub mod store;
pub mod types;

pub use bar::{Bar, earliest_timestamp, merge_bars};
pub use clock::{Clock, SystemClock};
pub use link::{BrokerLink, LinkFactory};
pub use middleware::LinkMiddleware;
pub use notice::{NoticeClass, classify, first_error, is_informational, to_error};
pub use persist::AtomicJsonFile;
pub use store::LocalStore;
pub use types::*;
