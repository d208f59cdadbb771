//! Builder for composing links with middleware layers.
//!
//! # Middleware Ordering Convention
//!
//! Layers form an "onion" around the raw link:
//!
//! ```text
//! Caller
//!     ↓
//! Outermost layer (e.g., Cooldown - checks first, observes errors last)
//!     ↓
//! Inner layer (e.g., Pacing - enforces the request budget)
//!     ↓
//! Raw link (the terminal connection)
//! ```
//!
//! `layers` is stored outermost-first (last added = outermost) and applied in
//! reverse during `build()`:
//!
//! ```text
//! builder.with_pacing(..).with_cooldown(..)
//!
//! Storage: [Cooldown, Pacing]
//! Result:  Cooldown(Pacing(Raw))
//! ```

use std::sync::Arc;
use std::time::Duration;

use backfill_core::{BrokerLink, LinkMiddleware, PacingConfig};
use serde_json::json;

use crate::cooldown::{CooldownGate, CooldownMiddleware};
use crate::pacing::{PacingBudget, PacingMiddleware};

/// Middleware builder for composing a link with layered wrappers.
pub struct LinkBuilder {
    raw: Arc<dyn BrokerLink>,
    /// Layers in outermost-first order.
    layers: Vec<Box<dyn LinkMiddleware>>,
}

impl LinkBuilder {
    /// Create a builder from a raw, unwrapped link.
    #[must_use]
    pub fn new(raw: Arc<dyn BrokerLink>) -> Self {
        Self {
            raw,
            layers: Vec::new(),
        }
    }

    /// Add or replace the pacing layer with a fresh budget.
    #[must_use]
    pub fn with_pacing(self, cfg: &PacingConfig) -> Self {
        let budget = Arc::new(PacingBudget::from_config(cfg));
        self.with_shared_pacing(cfg, budget)
    }

    /// Add or replace the pacing layer, drawing from a shared budget.
    #[must_use]
    pub fn with_shared_pacing(mut self, cfg: &PacingConfig, budget: Arc<PacingBudget>) -> Self {
        self.layers.retain(|m| m.name() != "PacingLink");
        self.layers.insert(
            0,
            Box::new(PacingMiddleware::with_budget(cfg.clone(), budget)),
        );
        self
    }

    /// Remove pacing if present.
    #[must_use]
    pub fn without_pacing(mut self) -> Self {
        self.layers.retain(|m| m.name() != "PacingLink");
        self
    }

    /// Add or replace the cooldown layer with its own gate.
    #[must_use]
    pub fn with_cooldown(self, period: Duration) -> Self {
        self.with_shared_cooldown(period, Arc::new(CooldownGate::new()))
    }

    /// Add or replace the cooldown layer behind a shared gate.
    #[must_use]
    pub fn with_shared_cooldown(mut self, period: Duration, gate: Arc<CooldownGate>) -> Self {
        self.layers.retain(|m| m.name() != "CooldownLink");
        self.layers
            .insert(0, Box::new(CooldownMiddleware::with_gate(period, gate)));
        self
    }

    /// Remove cooldown if present.
    #[must_use]
    pub fn without_cooldown(mut self) -> Self {
        self.layers.retain(|m| m.name() != "CooldownLink");
        self
    }

    /// Add an arbitrary layer at the outermost position.
    #[must_use]
    pub fn layer(mut self, layer: Box<dyn LinkMiddleware>) -> Self {
        self.layers.insert(0, layer);
        self
    }

    /// Layer names and configs, outermost first, with the raw link last.
    #[must_use]
    pub fn describe(&self) -> Vec<serde_json::Value> {
        let mut out: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|l| json!({ "name": l.name(), "config": l.config_json() }))
            .collect();
        out.push(json!({ "name": "RawLink", "config": { "name": self.raw.name() } }));
        out
    }

    /// Build the wrapped link, applying layers innermost first.
    #[must_use]
    pub fn build(self) -> Arc<dyn BrokerLink> {
        let mut acc: Arc<dyn BrokerLink> = Arc::clone(&self.raw);
        for m in self.layers.into_iter().rev() {
            acc = m.apply(acc);
        }
        acc
    }
}
