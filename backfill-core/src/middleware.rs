//! Middleware trait for wrapping `BrokerLink` implementations.

use std::sync::Arc;

use crate::link::BrokerLink;

/// Trait implemented by link middleware layers.
///
/// A middleware consumes an inner `BrokerLink` and returns a wrapped link that
/// augments or restricts behavior (e.g., pacing, cooldown).
pub trait LinkMiddleware: Send + Sync {
    /// Wrap `inner` and return the wrapped link.
    fn apply(self: Box<Self>, inner: Arc<dyn BrokerLink>) -> Arc<dyn BrokerLink>;

    /// Human-readable middleware name for introspection/logging.
    fn name(&self) -> &'static str;

    /// Opaque configuration snapshot for serialization/inspection.
    fn config_json(&self) -> serde_json::Value;
}
