use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Bar, BarRequest, BrokerLink, ClientId, ConnectParams, Contract, ContractSpec,
    ErrorNotice, LinkMiddleware, WhatToShow,
};
use chrono::{DateTime, Utc};

/// Cooldown deadline shared by every link behind one gate.
#[derive(Debug, Default)]
pub struct CooldownGate {
    until: Mutex<Option<Instant>>,
}

impl CooldownGate {
    /// Open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds left in the current cooldown, or `None` when open.
    #[must_use]
    pub fn remaining_ms(&self) -> Option<u64> {
        let mut guard = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *guard {
            Some(until) if now < until => {
                Some(u64::try_from((until - now).as_millis()).unwrap_or(u64::MAX).max(1))
            }
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    /// Close the gate for `period`, never shortening an existing cooldown.
    pub fn close_for(&self, period: Duration) {
        let until = Instant::now() + period;
        let mut guard = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(existing) if existing >= until => {}
            _ => *guard = Some(until),
        }
    }
}

/// Wrapper that stops data calls for a while after a pacing violation.
pub struct CooldownLink {
    inner: Arc<dyn BrokerLink>,
    gate: Arc<CooldownGate>,
    default_period: Duration,
}

impl CooldownLink {
    /// Wrap `inner`; `default_period` applies when a violation carries no reset hint.
    pub fn new(inner: Arc<dyn BrokerLink>, gate: Arc<CooldownGate>, default_period: Duration) -> Self {
        Self {
            inner,
            gate,
            default_period,
        }
    }

    fn check(&self) -> Result<(), BackfillError> {
        match self.gate.remaining_ms() {
            Some(reset_in_ms) => Err(BackfillError::CoolingDown { reset_in_ms }),
            None => Ok(()),
        }
    }

    fn observe<T>(&self, res: Result<T, BackfillError>) -> Result<T, BackfillError> {
        if let Err(BackfillError::PacingViolation { reset_in_ms }) = &res {
            let period = if *reset_in_ms > 0 {
                Duration::from_millis(*reset_in_ms)
            } else {
                self.default_period
            };
            #[cfg(feature = "tracing")]
            tracing::warn!(
                link = self.inner.name(),
                cooldown_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                "pacing violation; cooling down"
            );
            self.gate.close_for(period);
        }
        res
    }
}

#[async_trait]
impl BrokerLink for CooldownLink {
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
        self.check()?;
        let res = self.inner.fetch_bars(contract, req).await;
        self.observe(res)
    }

    async fn head_timestamp(
        &self,
        contract: &Contract,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Result<Option<DateTime<Utc>>, BackfillError> {
        self.check()?;
        let res = self
            .inner
            .head_timestamp(contract, what_to_show, use_rth)
            .await;
        self.observe(res)
    }

    fn drain_notices(&self) -> Vec<ErrorNotice> {
        self.inner.drain_notices()
    }
}

/// Middleware config for constructing a [`CooldownLink`].
pub struct CooldownMiddleware {
    period: Duration,
    gate: Arc<CooldownGate>,
}

impl CooldownMiddleware {
    /// Middleware with its own gate.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            gate: Arc::new(CooldownGate::new()),
        }
    }

    /// Middleware sharing an existing gate.
    #[must_use]
    pub const fn with_gate(period: Duration, gate: Arc<CooldownGate>) -> Self {
        Self { period, gate }
    }
}

impl LinkMiddleware for CooldownMiddleware {
    fn apply(self: Box<Self>, inner: Arc<dyn BrokerLink>) -> Arc<dyn BrokerLink> {
        Arc::new(CooldownLink::new(inner, self.gate, self.period))
    }

    fn name(&self) -> &'static str {
        "CooldownLink"
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({ "default_period_ms": self.period.as_millis() })
    }
}
