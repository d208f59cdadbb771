//! Test doubles for the backfill workspace.
//!
//! [`DynamicMockLink`] stands in for a terminal connection; every link built by
//! one [`MockLinkFactory`] shares the same scripted "terminal" state, which
//! tests drive through the paired [`DynamicMockController`].
#![warn(missing_docs)]

mod clock;
mod dynamic;
pub mod fixtures;
mod store;

pub use clock::ManualClock;
pub use dynamic::{DynamicMockController, DynamicMockLink, MockBehavior, MockLinkFactory};
pub use store::MemoryStore;
