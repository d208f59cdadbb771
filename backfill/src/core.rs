use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backfill_core::{
    BackfillConfig, BackfillError, ClientId, Clock, LinkFactory, LocalStore, PacingConfig,
    Purpose, SystemClock, Timeframe,
};
use backfill_middleware::PacedLinkFactory;
use chrono::{DateTime, Utc};

use crate::allocator::{BridgeSource, ConnectionAllocator, UpstreamConnections};
use crate::bridge::ExecContext;
use crate::fetcher::BridgeFetcher;
use crate::range::RangeDiscovery;
use crate::session::SessionManager;
use crate::validator::SymbolValidator;

/// Wired-up set of backfill services sharing one allocator.
pub struct Backfill {
    config: BackfillConfig,
    allocator: Arc<ConnectionAllocator>,
    validator: Arc<SymbolValidator>,
    ranges: Arc<RangeDiscovery>,
    sessions: Arc<SessionManager>,
}

/// Builder for constructing a [`Backfill`] with custom configuration.
pub struct BackfillBuilder {
    config: BackfillConfig,
    factory: Option<Arc<dyn LinkFactory>>,
    store: Option<Arc<dyn LocalStore>>,
    clock: Option<Arc<dyn Clock>>,
    upstream: Option<Arc<dyn UpstreamConnections>>,
    exec_context: ExecContext,
}

impl Default for BackfillBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackfillBuilder {
    /// Create a new builder with default configuration.
    ///
    /// Behavior and trade-offs:
    /// - Starts with no link factory; you must register one via
    ///   [`with_link_factory`](Self::with_link_factory).
    /// - No state files are written until a data directory or explicit paths
    ///   are set, so caches and sessions live only as long as the process.
    /// - No pacing layer is applied unless [`pacing`](Self::pacing) is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BackfillConfig::default(),
            factory: None,
            store: None,
            clock: None,
            upstream: None,
            exec_context: ExecContext::Blocking,
        }
    }

    /// Start from a complete configuration, e.g. one loaded with
    /// [`BackfillConfig::from_json_file`].
    #[must_use]
    pub fn with_config(mut self, config: BackfillConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the factory producing raw terminal links.
    #[must_use]
    pub fn with_link_factory(mut self, factory: Arc<dyn LinkFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Write every downloaded chunk through to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the time source used by every component.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Lend API-call connections from a longer-lived owner.
    #[must_use]
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamConnections>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Terminal host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.bridge.host = host.into();
        self
    }

    /// Terminal API port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.bridge.port = port;
        self
    }

    /// Identity of the bridge template. The allocator assigns purpose
    /// identities on top of it; throwaway workers offset from it.
    #[must_use]
    pub const fn client_id(mut self, id: ClientId) -> Self {
        self.config.bridge.client_id = id;
        self
    }

    /// Deadline for one connect attempt.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge.connect_timeout = timeout;
        self
    }

    /// Deadline for one blocking call.
    ///
    /// Behavior and trade-offs:
    /// - Bounds how long a caller thread can be held by a stalled terminal.
    /// - Large historical requests can legitimately take a while; too short a
    ///   value turns slow answers into chunk failures and retries.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge.call_timeout = timeout;
        self
    }

    /// Deadline for a call run on a throwaway worker.
    #[must_use]
    pub const fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge.worker_timeout = timeout;
        self
    }

    /// Connect attempts and the fixed pause between them.
    #[must_use]
    pub const fn connect_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.config.bridge.connect_retries = attempts;
        self.config.bridge.retry_delay = delay;
        self
    }

    /// Apply a request budget and cooldown to every link.
    ///
    /// Behavior and trade-offs:
    /// - All links share one budget, matching how the terminal paces the
    ///   account rather than individual connections.
    /// - `PacingMode::Fail` surfaces violations immediately (the session
    ///   manager records them as chunk failures); `PacingMode::Wait` blocks
    ///   the call until the window admits it.
    #[must_use]
    pub fn pacing(mut self, cfg: PacingConfig) -> Self {
        self.config.pacing = Some(cfg);
        self
    }

    /// Directory for the symbol cache and session files when their paths are
    /// not set explicitly.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// Location of the persisted symbol cache.
    #[must_use]
    pub fn symbol_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.validator.cache_path = Some(path.into());
        self
    }

    /// Location of the persisted session file.
    #[must_use]
    pub fn session_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sessions.state_path = Some(path.into());
        self
    }

    /// How long discovered ranges stay cached.
    #[must_use]
    pub const fn range_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.range.cache_ttl = ttl;
        self
    }

    /// How long validated contracts stay fresh before re-validation.
    #[must_use]
    pub const fn contract_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.validator.cache_ttl = ttl;
        self
    }

    /// Pause between chunk fetches.
    #[must_use]
    pub const fn chunk_delay(mut self, delay: Duration) -> Self {
        self.config.sessions.chunk_delay = delay;
        self
    }

    /// Execution context the services run their terminal calls in.
    #[must_use]
    pub const fn exec_context(mut self, ctx: ExecContext) -> Self {
        self.exec_context = ctx;
        self
    }

    /// Build the services and open the symbol-validation and data-manager
    /// connections.
    ///
    /// # Errors
    /// `Validation` when no link factory is registered, identity ranges
    /// overlap, or worker identities land inside a purpose range;
    /// `Connection` when a dedicated connection cannot be opened.
    pub fn build(self) -> Result<Backfill, BackfillError> {
        let Some(raw) = self.factory else {
            return Err(BackfillError::validation(
                "no link factory registered; add one via with_link_factory(...)",
            ));
        };
        let config = self.config.resolved();
        config.allocator.validate_with_workers(&config.bridge)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let factory: Arc<dyn LinkFactory> = match &config.pacing {
            Some(p) => Arc::new(PacedLinkFactory::new(raw, p.clone())),
            None => raw,
        };

        let mut allocator = ConnectionAllocator::new(
            config.bridge.clone(),
            config.allocator.clone(),
            factory,
        )
        .with_clock(Arc::clone(&clock));
        if let Some(upstream) = self.upstream {
            allocator = allocator.with_upstream(upstream);
        }
        let allocator = Arc::new(allocator);

        if let Err(e) = open_dedicated(&allocator) {
            allocator.release_all();
            return Err(e);
        }
        // Services go back to the registry on every call so a replaced
        // connection is picked up and the old identity is never reopened.
        let symbols = BridgeSource::allocated(Arc::clone(&allocator), Purpose::SymbolValidation)?;
        let data = BridgeSource::allocated(Arc::clone(&allocator), Purpose::DataManager)?;

        let ctx = self.exec_context;
        let validator = Arc::new(
            SymbolValidator::with_clock(symbols, config.validator.clone(), Arc::clone(&clock))
                .with_exec_context(ctx),
        );
        let ranges = RangeDiscovery::new(
            data.clone(),
            Arc::clone(&validator) as _,
            config.range.clone(),
        )
        .with_clock(Arc::clone(&clock))
        .with_exec_context(ctx);

        let mut fetcher = BridgeFetcher::new(data, Arc::clone(&validator) as _)
            .with_exec_context(ctx)
            .regular_hours_only(config.range.use_rth);
        if let Some(store) = self.store {
            fetcher = fetcher.with_store(store);
        }
        let sessions = SessionManager::new(Arc::new(fetcher), config.sessions.clone())
            .with_clock(Arc::clone(&clock));

        Ok(Backfill {
            config,
            allocator,
            validator,
            ranges: Arc::new(ranges),
            sessions: Arc::new(sessions),
        })
    }
}

fn open_dedicated(allocator: &ConnectionAllocator) -> Result<(), BackfillError> {
    allocator.acquire(Purpose::SymbolValidation, None)?;
    allocator.acquire(Purpose::DataManager, None)?;
    Ok(())
}

impl Backfill {
    /// Start building a new `Backfill` instance.
    ///
    /// ```rust,ignore
    /// use std::sync::Arc;
    /// use backfill::{Backfill, Timeframe};
    ///
    /// let backfill = Backfill::builder()
    ///     .with_link_factory(Arc::new(MyTerminalFactory::new()))
    ///     .data_dir("/var/lib/backfill")
    ///     .build()?;
    ///
    /// let (session_id, complete) = backfill.download_from_earliest("MSFT", Timeframe::H1)?;
    /// ```
    #[must_use]
    pub fn builder() -> BackfillBuilder {
        BackfillBuilder::new()
    }

    /// Effective configuration, with state paths resolved.
    #[must_use]
    pub const fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// The shared connection allocator.
    #[must_use]
    pub fn allocator(&self) -> &Arc<ConnectionAllocator> {
        &self.allocator
    }

    /// The symbol validator.
    #[must_use]
    pub fn validator(&self) -> &Arc<SymbolValidator> {
        &self.validator
    }

    /// The range discovery engine.
    #[must_use]
    pub fn ranges(&self) -> &Arc<RangeDiscovery> {
        &self.ranges
    }

    /// The session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Create a session for `[start, end)` with the default chunk size and run
    /// it once with the default retry limit.
    ///
    /// Returns the session id and whether every chunk completed.
    ///
    /// # Errors
    /// `Validation` for a symbol that does not resolve or a bad range.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "backfill::core::download", skip(self), fields(timeframe = %timeframe))
    )]
    pub fn download(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(String, bool), BackfillError> {
        if !self.validator.is_valid(symbol) {
            return Err(BackfillError::validation(format!("unknown symbol {symbol}")));
        }
        let id = self.sessions.create_session(
            symbol,
            timeframe,
            start,
            end,
            self.config.sessions.default_chunk_size_days,
        )?;
        let done = self
            .sessions
            .resume(&id, self.config.sessions.default_max_retries)?;
        Ok((id, done))
    }

    /// Download everything from the earliest available bar up to now.
    ///
    /// # Errors
    /// `Data` when no range can be discovered, otherwise as
    /// [`download`](Self::download).
    pub fn download_from_earliest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(String, bool), BackfillError> {
        let (earliest, latest) = self
            .ranges
            .range(symbol, timeframe)
            .ok_or_else(|| BackfillError::data(format!("no data range for {symbol}")))?;
        self.download(symbol, timeframe, earliest, latest)
    }

    /// Resume every session that still has work left; returns how many
    /// finished.
    ///
    /// Sessions that error out are skipped, so one broken record does not
    /// stop the rest.
    pub fn resume_all(&self) -> usize {
        self.sessions
            .resumable_sessions()
            .iter()
            .filter(|s| {
                self.sessions
                    .resume(&s.session_id, self.config.sessions.default_max_retries)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Disconnect every connection the allocator holds.
    pub fn shutdown(&self) -> usize {
        self.allocator.release_all()
    }
}
