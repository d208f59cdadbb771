//! Earliest-data discovery per (symbol, timeframe), with a TTL cache.
//!
//! The terminal's own head-timestamp answer is tried first. When it has none,
//! or refuses the query, a bounded binary search over daily-bar probes narrows
//! down where the series begins and a final refinement fetch pins the first bar.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backfill_core::{
    BackfillError, BarRequest, Clock, Contract, RangeCacheStats, RangeDiscoveryConfig,
    SystemClock, Timeframe, earliest_timestamp,
};
use chrono::{DateTime, Duration, Utc};

use crate::allocator::BridgeSource;
use crate::bridge::ExecContext;
use crate::validator::{ContractResolver, normalize_symbol};

/// One discovered (or injected) data range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCacheEntry {
    /// Normalized symbol.
    pub symbol: String,
    /// Timeframe the range applies to.
    pub timeframe: Timeframe,
    /// First timestamp with data.
    pub earliest: DateTime<Utc>,
    /// Last timestamp with data at caching time.
    pub latest: DateTime<Utc>,
    /// When the entry was stored.
    pub cached_at: DateTime<Utc>,
}

/// Nested result of [`RangeDiscovery::ranges`]: symbol, then timeframe.
pub type RangeMap = BTreeMap<String, BTreeMap<Timeframe, Option<(DateTime<Utc>, DateTime<Utc>)>>>;

/// Finds and caches the earliest available data per instrument.
pub struct RangeDiscovery {
    source: BridgeSource,
    resolver: Arc<dyn ContractResolver>,
    config: RangeDiscoveryConfig,
    clock: Arc<dyn Clock>,
    ctx: ExecContext,
    cache: Mutex<HashMap<(String, Timeframe), RangeCacheEntry>>,
}

impl RangeDiscovery {
    /// Engine issuing calls through `source` and resolving symbols through `resolver`.
    #[must_use]
    pub fn new(
        source: impl Into<BridgeSource>,
        resolver: Arc<dyn ContractResolver>,
        config: RangeDiscoveryConfig,
    ) -> Self {
        Self {
            source: source.into(),
            resolver,
            config,
            clock: Arc::new(SystemClock),
            ctx: ExecContext::Blocking,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run terminal calls in the given execution context.
    #[must_use]
    pub const fn with_exec_context(mut self, ctx: ExecContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Tunables in effect.
    #[must_use]
    pub const fn config(&self) -> &RangeDiscoveryConfig {
        &self.config
    }

    /// Earliest timestamp with data, or `None` when it cannot be determined.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "backfill::range::earliest", skip(self), fields(timeframe = %timeframe))
    )]
    pub fn earliest(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        let norm = normalize_symbol(symbol);
        if let Some(entry) = self.fresh_entry(&norm, timeframe) {
            return Some(entry.earliest);
        }

        match self.discover(&norm) {
            Ok(Some(earliest)) => {
                let now = self.clock.now();
                self.store(&norm, timeframe, earliest, now);
                self.resolver.remember_head_timestamp(&norm, timeframe, earliest);
                Some(earliest)
            }
            Ok(None) => {
                #[cfg(feature = "tracing")]
                tracing::info!(symbol = %norm, "no data range found");
                None
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(symbol = %norm, error = %_e, "range discovery failed");
                None
            }
        }
    }

    /// `(earliest, now)` for the pair, or `None` when discovery fails.
    pub fn range(&self, symbol: &str, timeframe: Timeframe) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let earliest = self.earliest(symbol, timeframe)?;
        Some((earliest, self.clock.now()))
    }

    /// Ranges for every symbol/timeframe pair. Failed pairs map to `None`.
    pub fn ranges<S: AsRef<str>>(&self, symbols: &[S], timeframes: &[Timeframe]) -> RangeMap {
        let mut out = RangeMap::new();
        for symbol in symbols {
            let per_tf = out.entry(symbol.as_ref().to_string()).or_default();
            for tf in timeframes {
                per_tf.insert(*tf, self.range(symbol.as_ref(), *tf));
            }
        }
        out
    }

    /// Store a known range, replacing any cached one.
    pub fn cache_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) {
        self.store(&normalize_symbol(symbol), timeframe, earliest, latest);
    }

    /// The cached `(earliest, latest)` exactly as stored, while fresh.
    #[must_use]
    pub fn get_cached_range(&self, symbol: &str, timeframe: Timeframe) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.fresh_entry(&normalize_symbol(symbol), timeframe)
            .map(|e| (e.earliest, e.latest))
    }

    /// Drop every cached range.
    pub fn clear_cache(&self) {
        self.lock().clear();
    }

    /// Cache counts.
    #[must_use]
    pub fn cache_stats(&self) -> RangeCacheStats {
        let now = self.clock.now();
        let cache = self.lock();
        let fresh = cache.values().filter(|e| self.is_fresh(e, now)).count();
        RangeCacheStats {
            entries: cache.len(),
            fresh,
            expired: cache.len() - fresh,
        }
    }

    fn store(&self, norm: &str, timeframe: Timeframe, earliest: DateTime<Utc>, latest: DateTime<Utc>) {
        let entry = RangeCacheEntry {
            symbol: norm.to_string(),
            timeframe,
            earliest,
            latest,
            cached_at: self.clock.now(),
        };
        self.lock().insert((norm.to_string(), timeframe), entry);
    }

    fn fresh_entry(&self, norm: &str, timeframe: Timeframe) -> Option<RangeCacheEntry> {
        let now = self.clock.now();
        self.lock()
            .get(&(norm.to_string(), timeframe))
            .filter(|e| self.is_fresh(e, now))
            .cloned()
    }

    fn is_fresh(&self, entry: &RangeCacheEntry, now: DateTime<Utc>) -> bool {
        Duration::from_std(self.config.cache_ttl).map_or(true, |ttl| now - entry.cached_at < ttl)
    }

    fn discover(&self, norm: &str) -> Result<Option<DateTime<Utc>>, BackfillError> {
        let Some(contract) = self.resolver.contract_for(norm)? else {
            return Ok(None);
        };

        let what = contract.asset_type.what_to_show();
        match self
            .source
            .bridge()?
            .head_timestamp(self.ctx, &contract, what, self.config.use_rth)
        {
            Ok(Some(ts)) => return Ok(Some(ts)),
            Ok(None) => {}
            Err(e) if e.is_connectivity() || matches!(e, BackfillError::PacingViolation { .. }) => {
                return Err(e);
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(symbol = %norm, error = %_e, "head timestamp unavailable; probing");
            }
        }

        self.probe_search(&contract)
    }

    /// Binary search for the first day with data, then one refinement fetch.
    fn probe_search(&self, contract: &Contract) -> Result<Option<DateTime<Utc>>, BackfillError> {
        let now = self.clock.now();
        let sample_days = self.config.probe_sample_days.max(1);
        let tolerance = Duration::days(self.config.presence_tolerance_days.max(0));
        let lookback_days = 365 * i64::from(self.config.max_lookback_years);

        let mut lo = now - Duration::days(lookback_days);
        let mut hi = now;
        let mut found = None;

        for _iteration in 0..self.config.max_iterations {
            if hi - lo <= tolerance {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            let req = self.probe_request(contract, mid + Duration::days(sample_days), sample_days);
            // Only an empty answer or a no-data error means "nothing here"; any
            // other failure says nothing about the midpoint.
            let first = match self.source.bridge()?.fetch_bars(self.ctx, contract, &req) {
                Ok(bars) => earliest_timestamp(&bars),
                Err(BackfillError::Data(_)) => None,
                Err(e) => return Err(e),
            };
            match first {
                Some(first) if first <= mid + tolerance => {
                    hi = mid;
                    found = Some(mid);
                }
                _ => lo = mid,
            }
            #[cfg(feature = "tracing")]
            tracing::trace!(iteration = _iteration, %lo, %hi, "probe narrowed");
        }

        let Some(found) = found else {
            return Ok(None);
        };

        let span = sample_days.max((hi - lo).num_days() + tolerance.num_days() + 1);
        let req = self.probe_request(contract, lo + Duration::days(span), span);
        match self.source.bridge()?.fetch_bars(self.ctx, contract, &req) {
            Ok(bars) => Ok(Some(earliest_timestamp(&bars).unwrap_or(found))),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_e, "refinement fetch failed; using probe boundary");
                Ok(Some(found))
            }
        }
    }

    fn probe_request(&self, contract: &Contract, end: DateTime<Utc>, span_days: i64) -> BarRequest {
        BarRequest {
            end,
            span_days,
            timeframe: Timeframe::D1,
            what_to_show: contract.asset_type.what_to_show(),
            use_rth: self.config.use_rth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, Timeframe), RangeCacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
