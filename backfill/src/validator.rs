//! Symbol to contract resolution with a persistent validated/failed cache.
//!
//! Candidates are tried forex, then equity, then future; the first one the
//! terminal qualifies wins. A symbol that was ever validated stays validated:
//! connectivity trouble or a later negative answer never moves it to the failed
//! set. Every state change rewrites the whole cache file atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backfill_core::{
    AssetType, AtomicJsonFile, BackfillError, Clock, Contract, ContractSpec, SystemClock,
    Timeframe, ValidatorConfig, ValidatorStats,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocator::BridgeSource;
use crate::bridge::ExecContext;

/// Resolves symbols to live contracts for the data services.
pub trait ContractResolver: Send + Sync {
    /// Qualified contract for `symbol`, or `None` when the symbol is invalid.
    ///
    /// # Errors
    /// Connectivity errors reaching the terminal.
    fn contract_for(&self, symbol: &str) -> Result<Option<Contract>, BackfillError>;

    /// Record the earliest timestamp discovered for `symbol` at `timeframe`.
    fn remember_head_timestamp(&self, symbol: &str, timeframe: Timeframe, ts: DateTime<Utc>);
}

/// Cached outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    /// Normalized symbol the record answers for.
    pub requested_symbol: String,
    /// Asset class the symbol resolved to.
    pub asset_type: AssetType,
    /// Venue of the resolved contract.
    pub exchange: String,
    /// Quote currency.
    pub currency: String,
    /// Long name, when the terminal supplied one.
    pub description: Option<String>,
    /// Instant of the successful resolution.
    pub validated_at: DateTime<Utc>,
    /// Earliest data per timeframe, as discovered so far.
    #[serde(default)]
    pub head_timestamps: BTreeMap<Timeframe, DateTime<Utc>>,
    /// Live handle; absent for records loaded from disk.
    #[serde(skip)]
    pub contract: Option<Contract>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SymbolCacheFile {
    #[serde(default)]
    cache: BTreeMap<String, ContractRecord>,
    #[serde(default)]
    failed_symbols: BTreeSet<String>,
    #[serde(default)]
    validated_symbols: BTreeSet<String>,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ValidatorState {
    cache: HashMap<String, ContractRecord>,
    validated: BTreeSet<String>,
    failed: BTreeSet<String>,
}

/// Normalize a raw ticker: trim, uppercase, and `/` becomes `.`.
#[must_use]
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase().replace('/', ".")
}

/// Split a normalized symbol into an FX pair, if it has that shape.
fn forex_pair(symbol: &str) -> Option<(&str, &str)> {
    let is_ccy = |s: &str| s.len() == 3 && s.chars().all(|c| c.is_ascii_alphabetic());
    if let Some((base, quote)) = symbol.split_once('.') {
        return (is_ccy(base) && is_ccy(quote)).then_some((base, quote));
    }
    if symbol.len() == 6 && symbol.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(symbol.split_at(3));
    }
    None
}

enum Outcome {
    Resolved(Contract),
    NotFound,
    Unreachable(BackfillError),
}

/// Resolves tickers against the terminal and remembers the answers.
pub struct SymbolValidator {
    source: BridgeSource,
    ctx: ExecContext,
    config: ValidatorConfig,
    clock: Arc<dyn Clock>,
    file: Option<AtomicJsonFile<SymbolCacheFile>>,
    state: Mutex<ValidatorState>,
}

impl SymbolValidator {
    /// Validator using the wall clock; loads the cache file if configured.
    #[must_use]
    pub fn new(source: impl Into<BridgeSource>, config: ValidatorConfig) -> Self {
        Self::with_clock(source, config, Arc::new(SystemClock))
    }

    /// Validator with an explicit time source.
    ///
    /// Records older than the cache TTL are dropped while loading; the symbol
    /// itself stays in the validated set. An unreadable file is logged and
    /// ignored.
    #[must_use]
    pub fn with_clock(
        source: impl Into<BridgeSource>,
        config: ValidatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let file = config
            .cache_path
            .as_deref()
            .map(AtomicJsonFile::<SymbolCacheFile>::new);
        let mut state = ValidatorState::default();
        if let Some(f) = &file {
            match f.load() {
                Ok(Some(saved)) => {
                    let now = clock.now();
                    let ttl = chrono::Duration::from_std(config.cache_ttl).unwrap_or(chrono::Duration::MAX);
                    state.cache = saved
                        .cache
                        .into_iter()
                        .filter(|(_, r)| now - r.validated_at < ttl)
                        .collect();
                    state.validated = saved.validated_symbols;
                    state.failed = saved
                        .failed_symbols
                        .into_iter()
                        .filter(|s| !state.validated.contains(s))
                        .collect();
                }
                Ok(None) => {}
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(path = %f.path().display(), error = %_e, "ignoring unreadable symbol cache");
                }
            }
        }
        Self {
            source: source.into(),
            ctx: ExecContext::Blocking,
            config,
            clock,
            file,
            state: Mutex::new(state),
        }
    }

    /// Run terminal calls in the given execution context.
    #[must_use]
    pub const fn with_exec_context(mut self, ctx: ExecContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Location of the cache file, if persisted.
    #[must_use]
    pub fn cache_path(&self) -> Option<&Path> {
        self.file.as_ref().map(AtomicJsonFile::path)
    }

    /// Whether `symbol` resolves to a contract.
    ///
    /// A symbol in the validated set stays valid even when its record has
    /// expired and the terminal cannot be reached to renew it.
    pub fn is_valid(&self, symbol: &str) -> bool {
        self.resolve(symbol).is_some() || self.is_known_valid(symbol)
    }

    /// Resolve `symbol`, consulting the cache first.
    ///
    /// Returns `None` for symbols that never validated. A validated symbol
    /// whose re-validation cannot reach the terminal returns its last good
    /// record.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "backfill::validator::resolve", skip(self))
    )]
    pub fn resolve(&self, symbol: &str) -> Option<ContractRecord> {
        let norm = normalize_symbol(symbol);
        if norm.is_empty() {
            return None;
        }

        let now = self.clock.now();
        let stale = {
            let state = self.lock();
            if let Some(rec) = state.cache.get(&norm) {
                if self.is_fresh(rec, now) {
                    return Some(rec.clone());
                }
            }
            if state.failed.contains(&norm) {
                return None;
            }
            state.cache.get(&norm).cloned()
        };

        match self.lookup(&norm) {
            Outcome::Resolved(contract) => Some(self.record_success(&norm, contract, stale)),
            Outcome::Unreachable(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(symbol = %norm, error = %_e, "terminal unreachable; keeping previous state");
                stale
            }
            Outcome::NotFound => {
                let mut state = self.lock();
                if state.validated.contains(&norm) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(symbol = %norm, "previously validated symbol not found; keeping last record");
                    return stale;
                }
                state.failed.insert(norm.clone());
                self.persist(&state);
                #[cfg(feature = "tracing")]
                tracing::info!(symbol = %norm, "symbol marked failed");
                None
            }
        }
    }

    /// Validity of each symbol, keyed by the symbol as given.
    pub fn validate_batch<S: AsRef<str>>(&self, symbols: &[S]) -> HashMap<String, bool> {
        symbols
            .iter()
            .map(|s| (s.as_ref().to_string(), self.is_valid(s.as_ref())))
            .collect()
    }

    /// Resolution of each symbol, keyed by the symbol as given.
    pub fn resolve_batch<S: AsRef<str>>(&self, symbols: &[S]) -> HashMap<String, Option<ContractRecord>> {
        symbols
            .iter()
            .map(|s| (s.as_ref().to_string(), self.resolve(s.as_ref())))
            .collect()
    }

    /// Cached record for `symbol` without contacting the terminal.
    #[must_use]
    pub fn cached(&self, symbol: &str) -> Option<ContractRecord> {
        self.lock().cache.get(&normalize_symbol(symbol)).cloned()
    }

    /// Whether `symbol` was ever validated.
    #[must_use]
    pub fn is_known_valid(&self, symbol: &str) -> bool {
        self.lock().validated.contains(&normalize_symbol(symbol))
    }

    /// Whether `symbol` is in the failed set.
    #[must_use]
    pub fn is_known_failed(&self, symbol: &str) -> bool {
        self.lock().failed.contains(&normalize_symbol(symbol))
    }

    /// Cache counts.
    #[must_use]
    pub fn stats(&self) -> ValidatorStats {
        let now = self.clock.now();
        let state = self.lock();
        let expired = state
            .cache
            .values()
            .filter(|r| !self.is_fresh(r, now))
            .count();
        ValidatorStats {
            validated: state.validated.len(),
            failed: state.failed.len(),
            cached_records: state.cache.len(),
            expired_records: expired,
        }
    }

    /// Forget everything, including the validated and failed sets.
    pub fn clear_cache(&self) {
        let mut state = self.lock();
        state.cache.clear();
        state.validated.clear();
        state.failed.clear();
        self.persist(&state);
    }

    /// Forget failed symbols only, so they are retried on next use.
    pub fn clear_failed(&self) {
        let mut state = self.lock();
        state.failed.clear();
        self.persist(&state);
    }

    fn is_fresh(&self, rec: &ContractRecord, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.config.cache_ttl)
            .map_or(true, |ttl| now - rec.validated_at < ttl)
    }

    fn candidates(&self, norm: &str) -> Vec<ContractSpec> {
        AssetType::RESOLUTION_ORDER
            .iter()
            .filter_map(|t| self.candidate(*t, norm))
            .collect()
    }

    fn candidate(&self, asset_type: AssetType, norm: &str) -> Option<ContractSpec> {
        match asset_type {
            AssetType::Forex => forex_pair(norm)
                .map(|(base, quote)| ContractSpec::forex(base, quote, self.config.forex_exchange.clone())),
            AssetType::Equity => Some(ContractSpec::equity(
                norm,
                self.config.equity_exchange.clone(),
                self.config.equity_currency.clone(),
            )),
            AssetType::Future => Some(ContractSpec::future(
                norm,
                self.config.future_exchange.clone(),
                self.config.future_currency.clone(),
            )),
        }
    }

    fn lookup(&self, norm: &str) -> Outcome {
        for spec in self.candidates(norm) {
            match self.source.bridge().and_then(|b| b.qualify(self.ctx, &spec)) {
                Ok(Some(contract)) => return Outcome::Resolved(contract),
                Ok(None) => {}
                Err(e) if e.is_connectivity() => return Outcome::Unreachable(e),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(symbol = %norm, asset_type = %spec.asset_type, error = %_e, "candidate rejected");
                }
            }
        }
        Outcome::NotFound
    }

    fn record_success(&self, norm: &str, contract: Contract, previous: Option<ContractRecord>) -> ContractRecord {
        let head_timestamps = previous
            .filter(|p| p.asset_type == contract.asset_type)
            .map(|p| p.head_timestamps)
            .unwrap_or_default();
        let record = ContractRecord {
            requested_symbol: norm.to_string(),
            asset_type: contract.asset_type,
            exchange: contract.exchange.clone(),
            currency: contract.currency.clone(),
            description: contract.description.clone(),
            validated_at: self.clock.now(),
            head_timestamps,
            contract: Some(contract),
        };
        let mut state = self.lock();
        state.cache.insert(norm.to_string(), record.clone());
        state.validated.insert(norm.to_string());
        state.failed.remove(norm);
        self.persist(&state);
        #[cfg(feature = "tracing")]
        tracing::info!(symbol = %norm, asset_type = %record.asset_type, "symbol validated");
        record
    }

    fn persist(&self, state: &ValidatorState) {
        let Some(file) = &self.file else {
            return;
        };
        let snapshot = SymbolCacheFile {
            cache: state
                .cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            failed_symbols: state.failed.clone(),
            validated_symbols: state.validated.clone(),
            last_updated: Some(self.clock.now()),
        };
        if let Err(_e) = file.save(&snapshot) {
            #[cfg(feature = "tracing")]
            tracing::warn!(path = %file.path().display(), error = %_e, "failed to persist symbol cache");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ValidatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ContractResolver for SymbolValidator {
    fn contract_for(&self, symbol: &str) -> Result<Option<Contract>, BackfillError> {
        let Some(record) = self.resolve(symbol) else {
            return Ok(None);
        };
        if let Some(contract) = record.contract {
            return Ok(Some(contract));
        }

        // Loaded from disk without a live handle: one targeted qualify.
        let norm = record.requested_symbol;
        let Some(spec) = self.candidate(record.asset_type, &norm) else {
            return Ok(None);
        };
        let contract = self.source.bridge()?.qualify(self.ctx, &spec)?;
        if let Some(c) = &contract {
            let mut state = self.lock();
            if let Some(rec) = state.cache.get_mut(&norm) {
                rec.contract = Some(c.clone());
            }
        }
        Ok(contract)
    }

    fn remember_head_timestamp(&self, symbol: &str, timeframe: Timeframe, ts: DateTime<Utc>) {
        let norm = normalize_symbol(symbol);
        let mut state = self.lock();
        let changed = match state.cache.get_mut(&norm) {
            Some(rec) if rec.head_timestamps.get(&timeframe) != Some(&ts) => {
                rec.head_timestamps.insert(timeframe, ts);
                true
            }
            _ => false,
        };
        if changed {
            self.persist(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_whitespace_and_slash() {
        assert_eq!(normalize_symbol("  eur/usd "), "EUR.USD");
        assert_eq!(normalize_symbol("msft"), "MSFT");
    }

    #[test]
    fn forex_shapes() {
        assert_eq!(forex_pair("EUR.USD"), Some(("EUR", "USD")));
        assert_eq!(forex_pair("GBPJPY"), Some(("GBP", "JPY")));
        assert_eq!(forex_pair("MSFT"), None);
        assert_eq!(forex_pair("BRK.B"), None);
        assert_eq!(forex_pair("ABC123"), None);
    }
}
