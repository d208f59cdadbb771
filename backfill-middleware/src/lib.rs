//! backfill-middleware
//!
//! `BrokerLink` wrappers that keep a caller inside the terminal's historical
//! data pacing rules:
//!
//! - [`PacingLink`]: sliding-window request budget on `fetch_bars` and
//!   `head_timestamp`; exceeding it fails with `PacingViolation` or waits.
//! - [`CooldownLink`]: after a pacing violation, short-circuits data calls with
//!   `CoolingDown` until the reset period passes.
//!
//! [`LinkBuilder`] composes layers outermost-first and [`PacedLinkFactory`]
//! applies the same stack to every link a factory produces.
#![warn(missing_docs)]

mod builder;
mod cooldown;
mod factory;
mod pacing;

pub use crate::builder::LinkBuilder;
pub use crate::cooldown::{CooldownGate, CooldownLink, CooldownMiddleware};
pub use crate::factory::PacedLinkFactory;
pub use crate::pacing::{PacingBudget, PacingLink, PacingMiddleware};
