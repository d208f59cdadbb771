use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use backfill_core::{
    AssetType, BackfillError, Bar, BarRequest, BrokerLink, ClientId, ConnectParams, Contract,
    ContractSpec, ErrorNotice, LinkFactory, WhatToShow,
};

/// Instruction for how a call should behave for a given input.
#[derive(Debug, Clone)]
pub enum MockBehavior<T> {
    /// Return the provided value immediately.
    Return(T),
    /// Fail immediately with the provided error.
    Fail(BackfillError),
    /// Return the value after sleeping.
    Delay(Duration, T),
    /// Hang indefinitely (simulate a stalled terminal).
    Hang,
}

impl<T> MockBehavior<T> {
    async fn run(self) -> Result<T, BackfillError> {
        match self {
            Self::Return(v) => Ok(v),
            Self::Fail(e) => Err(e),
            Self::Delay(d, v) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Self::Hang => std::future::pending().await,
        }
    }
}

/// Key a contract or spec is scripted under: the local symbol when present
/// (`"EUR.USD"`), otherwise the root symbol.
fn spec_key(spec: &ContractSpec) -> String {
    spec.local_symbol.clone().unwrap_or_else(|| spec.symbol.clone())
}

fn contract_key(contract: &Contract) -> String {
    contract
        .local_symbol
        .clone()
        .unwrap_or_else(|| contract.symbol.clone())
}

#[derive(Default)]
struct TerminalState {
    qualify_rules: HashMap<(AssetType, String), MockBehavior<Option<Contract>>>,
    accepted: HashSet<(AssetType, String)>,
    bar_series: HashMap<String, Vec<Bar>>,
    bar_rules: HashMap<String, MockBehavior<Vec<Bar>>>,
    bar_script: HashMap<String, VecDeque<MockBehavior<Vec<Bar>>>>,
    head_rules: HashMap<String, MockBehavior<Option<DateTime<Utc>>>>,
    pending_notices: VecDeque<ErrorNotice>,
    notices_after_fetch: VecDeque<ErrorNotice>,
    connect_failures_left: usize,
    refuse_connect: bool,
    connect_attempts: Vec<ClientId>,
    open_ids: Vec<ClientId>,
    epoch: u64,
    qualify_log: Vec<ContractSpec>,
    fetch_log: Vec<(String, BarRequest)>,
    head_calls: usize,
    links_created: usize,
}

type Shared = Arc<Mutex<TerminalState>>;

fn lock(state: &Shared) -> MutexGuard<'_, TerminalState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller handle used by tests to script the mock terminal.
#[derive(Clone)]
pub struct DynamicMockController {
    state: Shared,
}

impl DynamicMockController {
    /// Script `qualify` for one candidate.
    pub fn set_qualify_behavior(
        &self,
        asset_type: AssetType,
        key: impl Into<String>,
        behavior: MockBehavior<Option<Contract>>,
    ) {
        lock(&self.state)
            .qualify_rules
            .insert((asset_type, key.into()), behavior);
    }

    /// Make `qualify` succeed for `key` under `asset_type`, echoing the
    /// requested spec back as the contract.
    pub fn accept(&self, asset_type: AssetType, key: impl Into<String>) {
        lock(&self.state).accepted.insert((asset_type, key.into()));
    }

    /// Serve bars for `key` by slicing this series to each request window.
    pub fn set_bar_series(&self, key: impl Into<String>, bars: Vec<Bar>) {
        lock(&self.state).bar_series.insert(key.into(), bars);
    }

    /// Persistent `fetch_bars` behavior for `key`, overriding any series.
    pub fn set_bars_behavior(&self, key: impl Into<String>, behavior: MockBehavior<Vec<Bar>>) {
        lock(&self.state).bar_rules.insert(key.into(), behavior);
    }

    /// Queue a one-shot `fetch_bars` behavior for `key`. Queued behaviors are
    /// consumed in order before any persistent rule or series applies.
    pub fn push_bars_behavior(&self, key: impl Into<String>, behavior: MockBehavior<Vec<Bar>>) {
        lock(&self.state)
            .bar_script
            .entry(key.into())
            .or_default()
            .push_back(behavior);
    }

    /// Script `head_timestamp` for `key`.
    pub fn set_head_behavior(
        &self,
        key: impl Into<String>,
        behavior: MockBehavior<Option<DateTime<Utc>>>,
    ) {
        lock(&self.state).head_rules.insert(key.into(), behavior);
    }

    /// Queue an out-of-band notice for the next drain.
    pub fn inject_notice(&self, code: i32, message: impl Into<String>) {
        lock(&self.state)
            .pending_notices
            .push_back(ErrorNotice::new(code, message, Utc::now()));
    }

    /// Queue a notice that is emitted by the next `fetch_bars` call.
    pub fn inject_notice_on_fetch(&self, code: i32, message: impl Into<String>) {
        lock(&self.state)
            .notices_after_fetch
            .push_back(ErrorNotice::new(code, message, Utc::now()));
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        lock(&self.state).connect_failures_left = n;
    }

    /// Refuse every connect attempt until switched off.
    pub fn refuse_connects(&self, refuse: bool) {
        lock(&self.state).refuse_connect = refuse;
    }

    /// Drop every open connection, as if the terminal restarted.
    pub fn drop_all_connections(&self) {
        let mut guard = lock(&self.state);
        guard.epoch += 1;
        guard.open_ids.clear();
    }

    /// Identities of every connect attempt, in order.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<ClientId> {
        lock(&self.state).connect_attempts.clone()
    }

    /// Identities currently open.
    #[must_use]
    pub fn open_client_ids(&self) -> Vec<ClientId> {
        lock(&self.state).open_ids.clone()
    }

    /// Every `qualify` request received.
    #[must_use]
    pub fn qualify_log(&self) -> Vec<ContractSpec> {
        lock(&self.state).qualify_log.clone()
    }

    /// Every `fetch_bars` request received, keyed by contract.
    #[must_use]
    pub fn fetch_log(&self) -> Vec<(String, BarRequest)> {
        lock(&self.state).fetch_log.clone()
    }

    /// Number of `head_timestamp` calls received.
    #[must_use]
    pub fn head_calls(&self) -> usize {
        lock(&self.state).head_calls
    }

    /// Total remote data calls (`qualify`, `fetch_bars`, `head_timestamp`).
    #[must_use]
    pub fn remote_calls(&self) -> usize {
        let guard = lock(&self.state);
        guard.qualify_log.len() + guard.fetch_log.len() + guard.head_calls
    }

    /// Links built by the paired factory.
    #[must_use]
    pub fn links_created(&self) -> usize {
        lock(&self.state).links_created
    }

    /// Forget call logs, keeping scripted behaviors.
    pub fn reset_logs(&self) {
        let mut guard = lock(&self.state);
        guard.qualify_log.clear();
        guard.fetch_log.clear();
        guard.head_calls = 0;
        guard.connect_attempts.clear();
    }
}

static NEXT_CON_ID: AtomicI64 = AtomicI64::new(100_000);

/// A link that defers all behavior to the shared scripted terminal.
pub struct DynamicMockLink {
    state: Shared,
    session: Mutex<Option<(ClientId, u64)>>,
}

impl DynamicMockLink {
    fn session(&self) -> MutexGuard<'_, Option<(ClientId, u64)>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_id(&self) -> Option<ClientId> {
        let epoch = lock(&self.state).epoch;
        match *self.session() {
            Some((id, e)) if e == epoch => Some(id),
            _ => None,
        }
    }

    fn require_connected(&self) -> Result<(), BackfillError> {
        if self.live_id().is_some() {
            Ok(())
        } else {
            Err(BackfillError::connection("mock link is not connected"))
        }
    }
}

#[async_trait]
impl BrokerLink for DynamicMockLink {
    fn name(&self) -> &'static str {
        "dynamic-mock"
    }

    async fn connect(&self, params: &ConnectParams) -> Result<(), BackfillError> {
        let epoch = {
            let mut guard = lock(&self.state);
            guard.connect_attempts.push(params.client_id);
            if guard.refuse_connect {
                return Err(BackfillError::connection("connection refused"));
            }
            if guard.connect_failures_left > 0 {
                guard.connect_failures_left -= 1;
                return Err(BackfillError::connection("connection refused"));
            }
            if guard.open_ids.contains(&params.client_id) {
                return Err(BackfillError::connection(format!(
                    "client id {} already in use",
                    params.client_id
                )));
            }
            guard.open_ids.push(params.client_id);
            guard.epoch
        };
        *self.session() = Some((params.client_id, epoch));
        Ok(())
    }

    async fn disconnect(&self) {
        let prev = self.session().take();
        if let Some((id, epoch)) = prev {
            let mut guard = lock(&self.state);
            if guard.epoch == epoch {
                guard.open_ids.retain(|open| *open != id);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.live_id().is_some()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.live_id()
    }

    async fn qualify(&self, spec: &ContractSpec) -> Result<Option<Contract>, BackfillError> {
        self.require_connected()?;
        let key = (spec.asset_type, spec_key(spec));
        let behavior = {
            let mut guard = lock(&self.state);
            guard.qualify_log.push(spec.clone());
            match guard.qualify_rules.get(&key) {
                Some(b) => b.clone(),
                None if guard.accepted.contains(&key) => MockBehavior::Return(Some(Contract {
                    con_id: NEXT_CON_ID.fetch_add(1, Ordering::Relaxed),
                    symbol: spec.symbol.clone(),
                    local_symbol: spec.local_symbol.clone(),
                    asset_type: spec.asset_type,
                    exchange: spec.exchange.clone(),
                    currency: spec.currency.clone(),
                    description: Some(format!("{} mock contract", key.1)),
                })),
                None => MockBehavior::Return(None),
            }
        };
        behavior.run().await
    }

    async fn fetch_bars(
        &self,
        contract: &Contract,
        req: &BarRequest,
    ) -> Result<Vec<Bar>, BackfillError> {
        self.require_connected()?;
        let key = contract_key(contract);
        let behavior = {
            let mut guard = lock(&self.state);
            guard.fetch_log.push((key.clone(), req.clone()));
            let mut late = std::mem::take(&mut guard.notices_after_fetch);
            guard.pending_notices.append(&mut late);
            if let Some(next) = guard.bar_script.get_mut(&key).and_then(VecDeque::pop_front) {
                next
            } else if let Some(rule) = guard.bar_rules.get(&key) {
                rule.clone()
            } else if let Some(series) = guard.bar_series.get(&key) {
                let start = req.start();
                MockBehavior::Return(
                    series
                        .iter()
                        .filter(|b| b.ts >= start && b.ts < req.end)
                        .copied()
                        .collect(),
                )
            } else {
                MockBehavior::Return(Vec::new())
            }
        };
        behavior.run().await
    }

    async fn head_timestamp(
        &self,
        contract: &Contract,
        _what_to_show: WhatToShow,
        _use_rth: bool,
    ) -> Result<Option<DateTime<Utc>>, BackfillError> {
        self.require_connected()?;
        let behavior = {
            let mut guard = lock(&self.state);
            guard.head_calls += 1;
            guard
                .head_rules
                .get(&contract_key(contract))
                .cloned()
                .unwrap_or(MockBehavior::Return(None))
        };
        behavior.run().await
    }

    fn drain_notices(&self) -> Vec<ErrorNotice> {
        lock(&self.state).pending_notices.drain(..).collect()
    }
}

/// Factory whose links all talk to one scripted terminal.
pub struct MockLinkFactory {
    state: Shared,
}

impl MockLinkFactory {
    /// Create a factory and the controller for its terminal.
    #[must_use]
    pub fn new_with_controller() -> (Arc<Self>, DynamicMockController) {
        let state: Shared = Arc::new(Mutex::new(TerminalState::default()));
        let controller = DynamicMockController {
            state: Arc::clone(&state),
        };
        (Arc::new(Self { state }), controller)
    }
}

impl LinkFactory for MockLinkFactory {
    fn create(&self) -> Arc<dyn BrokerLink> {
        lock(&self.state).links_created += 1;
        Arc::new(DynamicMockLink {
            state: Arc::clone(&self.state),
            session: Mutex::new(None),
        })
    }
}
