//! Configuration types shared by the bridge, the allocator and the data services.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BackfillError;
use crate::market::{ClientId, Purpose};

/// Connection parameters and timing for one synchronous bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Terminal host name or address.
    pub host: String,
    /// Terminal API port.
    pub port: u16,
    /// Client identity used for the primary link.
    pub client_id: ClientId,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
    /// Deadline for one blocking call routed through the owned runtime.
    pub call_timeout: Duration,
    /// Deadline for a call executed on a throwaway worker thread.
    pub worker_timeout: Duration,
    /// Open the link read-only (no order routing).
    pub readonly: bool,
    /// Connect attempts before giving up.
    pub connect_retries: u32,
    /// Fixed delay between connect attempts.
    pub retry_delay: Duration,
    /// Offset added to `client_id` for throwaway worker identities.
    pub worker_identity_offset: i32,
    /// Number of rotating identities available to throwaway workers.
    pub worker_identity_slots: i32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: ClientId(1),
            connect_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(600),
            readonly: true,
            connect_retries: 3,
            retry_delay: Duration::from_secs(2),
            worker_identity_offset: 1000,
            worker_identity_slots: 50,
        }
    }
}

impl BridgeConfig {
    /// Copy of this config bound to another client identity.
    #[must_use]
    pub fn with_client_id(&self, client_id: ClientId) -> Self {
        Self {
            client_id,
            ..self.clone()
        }
    }

    /// Identities throwaway workers rotate through for a bridge opened as
    /// `client_id`.
    #[must_use]
    pub const fn worker_identities(&self, client_id: ClientId) -> IdentityRange {
        let first = client_id.offset(self.worker_identity_offset).get();
        let slots = if self.worker_identity_slots > 1 { self.worker_identity_slots } else { 1 };
        IdentityRange::new(first, first.saturating_add(slots - 1))
    }
}

/// Inclusive range of client identities reserved for one purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRange {
    /// First identity in the range.
    pub first: i32,
    /// Last identity in the range (inclusive).
    pub last: i32,
}

impl IdentityRange {
    /// Build a range; `first` and `last` are swapped if given out of order.
    #[must_use]
    pub const fn new(first: i32, last: i32) -> Self {
        if first <= last {
            Self { first, last }
        } else {
            Self {
                first: last,
                last: first,
            }
        }
    }

    /// Whether `id` falls inside the range.
    #[must_use]
    pub const fn contains(&self, id: i32) -> bool {
        id >= self.first && id <= self.last
    }

    /// Number of identities in the range.
    #[must_use]
    pub const fn len(&self) -> i32 {
        self.last - self.first + 1
    }

    /// Always false; ranges hold at least one identity.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether two ranges share any identity.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Identity ranges and housekeeping cadence for the connection allocator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Identities for the interactive API singleton.
    pub api_call: IdentityRange,
    /// Identities for the dedicated gap-filler connection.
    pub gap_filler: IdentityRange,
    /// Identities for the dedicated symbol-validation connection.
    pub symbol_validation: IdentityRange,
    /// Identities for the dedicated data-manager connection.
    pub data_manager: IdentityRange,
    /// Rotating pool for batch jobs.
    pub batch: IdentityRange,
    /// Rotating pool for CLI one-shots.
    pub cli: IdentityRange,
    /// Rotating pool for tests.
    pub test: IdentityRange,
    /// Base of the degraded identity source used when a pool is exhausted.
    pub fallback_base: i32,
    /// Minimum spacing between two idle sweeps.
    pub sweep_interval: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            api_call: IdentityRange::new(1, 9),
            gap_filler: IdentityRange::new(10, 19),
            symbol_validation: IdentityRange::new(20, 29),
            data_manager: IdentityRange::new(30, 39),
            batch: IdentityRange::new(200, 299),
            cli: IdentityRange::new(300, 399),
            test: IdentityRange::new(900, 999),
            fallback_base: 100,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl AllocatorConfig {
    /// Identity range reserved for `purpose`.
    #[must_use]
    pub const fn range_for(&self, purpose: Purpose) -> IdentityRange {
        match purpose {
            Purpose::ApiCall => self.api_call,
            Purpose::GapFiller => self.gap_filler,
            Purpose::SymbolValidation => self.symbol_validation,
            Purpose::DataManager => self.data_manager,
            Purpose::Batch => self.batch,
            Purpose::Cli => self.cli,
            Purpose::Test => self.test,
        }
    }

    /// Reject configurations whose purpose ranges overlap.
    ///
    /// # Errors
    /// Returns `Validation` naming the first overlapping pair.
    pub fn validate(&self) -> Result<(), BackfillError> {
        let all = Purpose::ALL;
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if self.range_for(*a).overlaps(&self.range_for(*b)) {
                    return Err(BackfillError::validation(format!(
                        "identity ranges for {a} and {b} overlap"
                    )));
                }
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate), then reject worker identities that
    /// could collide with an allocated connection.
    ///
    /// A bridge opened under any identity of a purpose range hands its
    /// throwaway workers identities offset from its own; the band those
    /// span must stay clear of every purpose range.
    ///
    /// # Errors
    /// Returns `Validation` naming the first purpose whose worker band
    /// overlaps a purpose range.
    pub fn validate_with_workers(&self, bridge: &BridgeConfig) -> Result<(), BackfillError> {
        self.validate()?;
        for owner in Purpose::ALL {
            let range = self.range_for(owner);
            let band = IdentityRange::new(
                bridge.worker_identities(ClientId(range.first)).first,
                bridge.worker_identities(ClientId(range.last)).last,
            );
            if let Some(other) = Purpose::ALL
                .into_iter()
                .find(|p| band.overlaps(&self.range_for(*p)))
            {
                return Err(BackfillError::validation(format!(
                    "worker identities {}..={} of {owner} connections overlap the {other} range",
                    band.first, band.last
                )));
            }
        }
        Ok(())
    }
}

/// Tunables for earliest-data discovery.
///
/// The probe constants were tuned empirically against the terminal and are
/// kept configurable for that reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RangeDiscoveryConfig {
    /// How long a discovered range stays valid.
    pub cache_ttl: Duration,
    /// How far back the probe search window reaches.
    pub max_lookback_years: u32,
    /// Length of each probe sample request.
    pub probe_sample_days: i64,
    /// A probe counts as "data present" when its first bar is within this many days.
    pub presence_tolerance_days: i64,
    /// Hard cap on probe iterations.
    pub max_iterations: u32,
    /// Restrict probes and head-timestamp queries to regular trading hours.
    pub use_rth: bool,
}

impl Default for RangeDiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(86_400),
            max_lookback_years: 20,
            probe_sample_days: 30,
            presence_tolerance_days: 7,
            max_iterations: 20,
            use_rth: false,
        }
    }
}

/// Venues, currencies and cache policy for symbol validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Location of the persisted symbol cache; `None` keeps it in memory only.
    pub cache_path: Option<PathBuf>,
    /// Age after which a validated record is re-checked against the terminal.
    pub cache_ttl: Duration,
    /// Venue for spot FX candidates.
    pub forex_exchange: String,
    /// Venue for equity candidates.
    pub equity_exchange: String,
    /// Currency for equity candidates.
    pub equity_currency: String,
    /// Venue for future candidates.
    pub future_exchange: String,
    /// Currency for future candidates.
    pub future_currency: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            cache_ttl: Duration::from_secs(30 * 86_400),
            forex_exchange: "IDEALPRO".to_string(),
            equity_exchange: "SMART".to_string(),
            equity_currency: "USD".to_string(),
            future_exchange: "CME".to_string(),
            future_currency: "USD".to_string(),
        }
    }
}

/// Persistence and pacing for resumable download sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Location of the persisted session file; `None` keeps sessions in memory only.
    pub state_path: Option<PathBuf>,
    /// Pause between two chunk fetches.
    pub chunk_delay: Duration,
    /// Chunk length used when callers do not specify one.
    pub default_chunk_size_days: u32,
    /// Attempts per chunk used when callers do not specify a limit.
    pub default_max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            chunk_delay: Duration::from_millis(500),
            default_chunk_size_days: 30,
            default_max_retries: 3,
        }
    }
}

/// What a pacing layer does when the request budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PacingMode {
    /// Fail immediately with `PacingViolation`.
    #[default]
    Fail,
    /// Sleep until the window admits another request (with jitter), then proceed.
    Wait,
}

/// Request budget for historical and head-timestamp calls on one link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PacingConfig {
    /// Maximum number of requests in one window.
    pub limit: u64,
    /// Length of the accounting window.
    pub window: Duration,
    /// Behaviour when the budget is exhausted.
    pub mode: PacingMode,
    /// Random jitter percentage [0, 100] added to waits in `Wait` mode.
    pub jitter_percent: u8,
    /// How long the cooldown layer short-circuits calls after a pacing violation.
    pub cooldown: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(600),
            mode: PacingMode::Fail,
            jitter_percent: 20,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Aggregate configuration for the `Backfill` facade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BackfillConfig {
    /// Template for every bridge; the allocator overrides `client_id`.
    pub bridge: BridgeConfig,
    /// Identity ranges and sweep cadence.
    pub allocator: AllocatorConfig,
    /// Earliest-data discovery tunables.
    pub range: RangeDiscoveryConfig,
    /// Symbol validation policy.
    pub validator: ValidatorConfig,
    /// Session persistence and pacing.
    pub sessions: SessionConfig,
    /// Optional pacing layer applied to every link.
    pub pacing: Option<PacingConfig>,
    /// Directory for state files whose paths are not set explicitly.
    pub data_dir: Option<PathBuf>,
}

impl BackfillConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    ///
    /// # Errors
    /// Returns `Persistence` when the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BackfillError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    /// Fill unset state-file paths from `data_dir`.
    #[must_use]
    pub fn resolved(mut self) -> Self {
        if let Some(dir) = self.data_dir.clone() {
            if self.validator.cache_path.is_none() {
                self.validator.cache_path = Some(dir.join("symbol_cache.json"));
            }
            if self.sessions.state_path.is_none() {
                self.sessions.state_path = Some(dir.join("download_sessions.json"));
            }
        }
        self
    }
}
