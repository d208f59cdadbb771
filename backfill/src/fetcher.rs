use std::sync::Arc;

use backfill_core::{BackfillError, Bar, BarRequest, LocalStore, Timeframe, merge_bars};
use chrono::{DateTime, Duration, Utc};

use crate::allocator::BridgeSource;
use crate::bridge::ExecContext;
use crate::session::BarFetcher;
use crate::validator::ContractResolver;

/// [`BarFetcher`] over a bridge, resolving symbols through a
/// [`ContractResolver`].
///
/// Windows longer than the timeframe's per-request limit are split into
/// several requests. When a store is attached, fetched bars are merged into
/// the stored series before being returned.
pub struct BridgeFetcher {
    source: BridgeSource,
    resolver: Arc<dyn ContractResolver>,
    store: Option<Arc<dyn LocalStore>>,
    ctx: ExecContext,
    use_rth: bool,
}

impl BridgeFetcher {
    /// Fetcher issuing requests through `source`.
    #[must_use]
    pub fn new(source: impl Into<BridgeSource>, resolver: Arc<dyn ContractResolver>) -> Self {
        Self {
            source: source.into(),
            resolver,
            store: None,
            ctx: ExecContext::Blocking,
            use_rth: false,
        }
    }

    /// Write fetched bars through to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run terminal calls in the given execution context.
    #[must_use]
    pub const fn with_exec_context(mut self, ctx: ExecContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Restrict requests to regular trading hours.
    #[must_use]
    pub const fn regular_hours_only(mut self, use_rth: bool) -> Self {
        self.use_rth = use_rth;
        self
    }
}

impl BarFetcher for BridgeFetcher {
    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError> {
        let contract = self
            .resolver
            .contract_for(symbol)?
            .ok_or_else(|| BackfillError::data(format!("no contract for {symbol}")))?;
        let what = contract.asset_type.what_to_show();
        let step = Duration::days(timeframe.max_request_days().max(1));

        let bridge = self.source.bridge()?;
        let mut fetched = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let next = (cursor + step).min(end);
            let req = BarRequest::between(cursor, next, timeframe, what, self.use_rth);
            fetched.extend(bridge.fetch_bars(self.ctx, &contract, &req)?);
            cursor = next;
        }
        fetched.retain(|b| b.ts >= start && b.ts < end);
        let bars = merge_bars(&[], &fetched);

        if let Some(store) = &self.store {
            if !bars.is_empty() {
                let existing = store.load(symbol, timeframe)?.unwrap_or_default();
                store.save(symbol, timeframe, &merge_bars(&existing, &bars))?;
                #[cfg(feature = "tracing")]
                tracing::debug!(symbol, timeframe = %timeframe, bars = bars.len(), "bars written through to store");
            }
        }
        Ok(bars)
    }
}
