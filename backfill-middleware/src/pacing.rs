//! Sliding-window pacing for historical data requests.
//!
//! Only `fetch_bars` and `head_timestamp` are metered; the terminal does not
//! pace contract lookups or connection management.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Bar, BarRequest, BrokerLink, ClientId, ConnectParams, Contract, ContractSpec,
    ErrorNotice, LinkMiddleware, PacingConfig, PacingMode, WhatToShow,
};
use chrono::{DateTime, Utc};
use rand::Rng;

/// Request budget shared by every link drawing from it.
///
/// Keeps the instants of admitted requests within the last `window`; a request
/// is admitted while fewer than `limit` remain.
#[derive(Debug)]
pub struct PacingBudget {
    limit: u64,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl PacingBudget {
    /// Budget of `limit` requests per sliding `window`.
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Budget from a pacing configuration.
    #[must_use]
    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self::new(cfg.limit, cfg.window)
    }

    /// Try to admit one request now.
    ///
    /// # Errors
    /// Returns `PacingViolation` with the time until the oldest admitted request
    /// leaves the window when the budget is exhausted.
    pub fn try_admit(&self) -> Result<(), BackfillError> {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while let Some(front) = admitted.front() {
            if now.duration_since(*front) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if (admitted.len() as u64) < self.limit {
            admitted.push_back(now);
            return Ok(());
        }

        let reset_in_ms = admitted.front().map_or(0, |oldest| {
            let left = self.window.saturating_sub(now.duration_since(*oldest));
            u64::try_from(left.as_millis()).unwrap_or(u64::MAX)
        });
        Err(BackfillError::PacingViolation {
            reset_in_ms: reset_in_ms.max(1),
        })
    }

    /// Requests currently counted against the window.
    #[must_use]
    pub fn in_window(&self) -> usize {
        let admitted = self
            .admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        admitted
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

fn jitter_wait(base_ms: u64, jitter_percent: u8) -> u64 {
    let jitter_range = if jitter_percent == 0 {
        1
    } else {
        std::cmp::max(1, base_ms.saturating_mul(u64::from(jitter_percent)) / 100)
    };
    let mut rng = rand::rng();
    base_ms + rng.random_range(0..jitter_range)
}

/// Wrapper that meters historical requests against a [`PacingBudget`].
pub struct PacingLink {
    inner: Arc<dyn BrokerLink>,
    budget: Arc<PacingBudget>,
    mode: PacingMode,
    jitter_percent: u8,
}

impl PacingLink {
    /// Wrap `inner`, drawing from `budget`.
    pub fn new(
        inner: Arc<dyn BrokerLink>,
        budget: Arc<PacingBudget>,
        mode: PacingMode,
        jitter_percent: u8,
    ) -> Self {
        Self {
            inner,
            budget,
            mode,
            jitter_percent,
        }
    }

    async fn admit(&self) -> Result<(), BackfillError> {
        loop {
            match self.budget.try_admit() {
                Ok(()) => return Ok(()),
                Err(BackfillError::PacingViolation { reset_in_ms })
                    if self.mode == PacingMode::Wait =>
                {
                    let wait_ms = jitter_wait(reset_in_ms, self.jitter_percent);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(wait_ms, "pacing budget exhausted; waiting");
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BrokerLink for PacingLink {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn connect(&self, params: &ConnectParams) -> Result<(), BackfillError> {
        self.inner.connect(params).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.inner.client_id()
    }

    async fn qualify(&self, spec: &ContractSpec) -> Result<Option<Contract>, BackfillError> {
        self.inner.qualify(spec).await
    }

    async fn fetch_bars(
        &self,
        contract: &Contract,
        req: &BarRequest,
    ) -> Result<Vec<Bar>, BackfillError> {
        self.admit().await?;
        self.inner.fetch_bars(contract, req).await
    }

    async fn head_timestamp(
        &self,
        contract: &Contract,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Result<Option<DateTime<Utc>>, BackfillError> {
        self.admit().await?;
        self.inner
            .head_timestamp(contract, what_to_show, use_rth)
            .await
    }

    fn drain_notices(&self) -> Vec<ErrorNotice> {
        self.inner.drain_notices()
    }
}

/// Middleware config for constructing a [`PacingLink`].
pub struct PacingMiddleware {
    config: PacingConfig,
    budget: Arc<PacingBudget>,
}

impl PacingMiddleware {
    /// Middleware with its own fresh budget.
    #[must_use]
    pub fn new(config: PacingConfig) -> Self {
        let budget = Arc::new(PacingBudget::from_config(&config));
        Self { config, budget }
    }

    /// Middleware drawing from an existing shared budget.
    #[must_use]
    pub const fn with_budget(config: PacingConfig, budget: Arc<PacingBudget>) -> Self {
        Self { config, budget }
    }
}

impl LinkMiddleware for PacingMiddleware {
    fn apply(self: Box<Self>, inner: Arc<dyn BrokerLink>) -> Arc<dyn BrokerLink> {
        Arc::new(PacingLink::new(
            inner,
            self.budget,
            self.config.mode,
            self.config.jitter_percent,
        ))
    }

    fn name(&self) -> &'static str {
        "PacingLink"
    }

    fn config_json(&self) -> serde_json::Value {
        let mode = match self.config.mode {
            PacingMode::Wait => "Wait",
            _ => "Fail",
        };
        serde_json::json!({
            "limit": self.config.limit,
            "window_ms": self.config.window.as_millis(),
            "mode": mode,
            "jitter_percent": self.config.jitter_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_reports_time_until_oldest_expires() {
        let budget = PacingBudget::new(2, Duration::from_secs(60));
        budget.try_admit().unwrap();
        budget.try_admit().unwrap();
        match budget.try_admit() {
            Err(BackfillError::PacingViolation { reset_in_ms }) => {
                assert!(reset_in_ms > 59_000 && reset_in_ms <= 60_000);
            }
            other => panic!("expected pacing violation, got {other:?}"),
        }
        assert_eq!(budget.in_window(), 2);
    }

    #[test]
    fn jitter_stays_within_percent() {
        for _ in 0..100 {
            let w = jitter_wait(1_000, 20);
            assert!((1_000..1_200).contains(&w));
        }
        assert_eq!(jitter_wait(500, 0), 500);
    }
}
