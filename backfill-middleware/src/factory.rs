use std::sync::Arc;

use backfill_core::{BrokerLink, LinkFactory, PacingConfig};

use crate::builder::LinkBuilder;
use crate::cooldown::CooldownGate;
use crate::pacing::PacingBudget;

/// Factory decorator that wraps every produced link in
/// `Cooldown(Pacing(raw))`.
///
/// All links share one budget and one gate, since the terminal paces the
/// account rather than the individual connection.
pub struct PacedLinkFactory {
    inner: Arc<dyn LinkFactory>,
    config: PacingConfig,
    budget: Arc<PacingBudget>,
    gate: Arc<CooldownGate>,
}

impl PacedLinkFactory {
    /// Decorate `inner` with the given pacing configuration.
    #[must_use]
    pub fn new(inner: Arc<dyn LinkFactory>, config: PacingConfig) -> Self {
        let budget = Arc::new(PacingBudget::from_config(&config));
        Self {
            inner,
            config,
            budget,
            gate: Arc::new(CooldownGate::new()),
        }
    }

    /// Shared budget, for inspection.
    #[must_use]
    pub fn budget(&self) -> &Arc<PacingBudget> {
        &self.budget
    }

    /// Shared cooldown gate, for inspection.
    #[must_use]
    pub fn gate(&self) -> &Arc<CooldownGate> {
        &self.gate
    }
}

impl LinkFactory for PacedLinkFactory {
    fn create(&self) -> Arc<dyn BrokerLink> {
        LinkBuilder::new(self.inner.create())
            .with_shared_pacing(&self.config, Arc::clone(&self.budget))
            .with_shared_cooldown(self.config.cooldown, Arc::clone(&self.gate))
            .build()
    }
}
