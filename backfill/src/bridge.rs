//! Blocking facade over one callback-driven terminal connection.
//!
//! A [`SyncBridge`] owns a dedicated single-worker Tokio runtime for as long as
//! its link is open. Every call is spawned onto that runtime and the calling
//! thread blocks on a channel until the result arrives or the call deadline
//! passes. The state lock is never held while a call is in flight, so
//! [`SyncBridge::is_connected`] answers immediately. Callers that are themselves running on a cooperative executor pass
//! [`ExecContext::InsideRuntime`]; their calls run on a throwaway worker thread
//! with its own short-lived connection so the caller's executor is never asked
//! to drive the bridge's link.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backfill_core::{
    BackfillError, Bar, BarRequest, BridgeConfig, BrokerLink, ClientId, ConnectParams, Contract,
    ContractSpec, LinkFactory, NoticeClass, WhatToShow, classify, first_error,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::runtime::{Handle, Runtime};

/// Where the caller of a blocking operation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecContext {
    /// A plain thread that may block.
    #[default]
    Blocking,
    /// A task on a cooperative executor.
    InsideRuntime,
}

/// Connection lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No open link.
    Disconnected,
    /// Connect attempts in progress.
    Connecting,
    /// Link open and usable.
    Connected,
}

struct BridgeInner {
    state: BridgeState,
    link: Option<Arc<dyn BrokerLink>>,
    runtime: Option<Runtime>,
}

/// One terminal connection usable from blocking code.
pub struct SyncBridge {
    config: BridgeConfig,
    factory: Arc<dyn LinkFactory>,
    inner: Mutex<BridgeInner>,
    next_worker_slot: AtomicI32,
}

type LinkCall<T> =
    Box<dyn FnOnce(Arc<dyn BrokerLink>) -> BoxFuture<'static, Result<T, BackfillError>> + Send>;

fn boxed_call<T, F, Fut>(f: F) -> LinkCall<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<dyn BrokerLink>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, BackfillError>> + Send + 'static,
{
    Box::new(
        move |link: Arc<dyn BrokerLink>| -> BoxFuture<'static, Result<T, BackfillError>> {
            Box::pin(f(link))
        },
    )
}

impl SyncBridge {
    /// Bridge that has not connected yet.
    #[must_use]
    pub fn new(config: BridgeConfig, factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            config,
            factory,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Disconnected,
                link: None,
                runtime: None,
            }),
            next_worker_slot: AtomicI32::new(0),
        }
    }

    /// Build a bridge and connect it, retrying per `config`.
    ///
    /// # Errors
    /// Returns `Connection` once every attempt failed.
    pub fn connect(config: BridgeConfig, factory: Arc<dyn LinkFactory>) -> Result<Self, BackfillError> {
        let bridge = Self::new(config, factory);
        bridge.try_ensure_connected()?;
        Ok(bridge)
    }

    /// Identity the primary link opens under.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.config.client_id
    }

    /// Bridge configuration.
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        let mut inner = self.lock();
        Self::refresh(&mut inner);
        inner.state
    }

    /// Whether the link is open and reports itself connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == BridgeState::Connected
    }

    /// Connect if needed. Returns whether the bridge is connected afterwards.
    pub fn ensure_connected(&self) -> bool {
        self.try_ensure_connected().is_ok()
    }

    /// Connect if needed.
    ///
    /// # Errors
    /// Returns `Connection` once every attempt failed.
    pub fn try_ensure_connected(&self) -> Result<(), BackfillError> {
        let mut inner = self.lock();
        self.ensure_locked(&mut inner)
    }

    /// Close the link and tear down the owned runtime. Safe to call repeatedly.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "backfill::bridge::disconnect",
            skip(self),
            fields(client_id = %self.config.client_id),
        )
    )]
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        self.teardown(&mut inner);
    }

    /// Resolve a contract spec.
    ///
    /// # Errors
    /// Connection, timeout and remote-notice errors from the call.
    pub fn qualify(&self, ctx: ExecContext, spec: &ContractSpec) -> Result<Option<Contract>, BackfillError> {
        let spec = spec.clone();
        self.call(ctx, "qualify", move |link| async move {
            link.qualify(&spec).await
        })
    }

    /// Fetch historical bars.
    ///
    /// # Errors
    /// Connection, timeout and remote-notice errors from the call.
    pub fn fetch_bars(
        &self,
        ctx: ExecContext,
        contract: &Contract,
        req: &BarRequest,
    ) -> Result<Vec<Bar>, BackfillError> {
        let contract = contract.clone();
        let req = req.clone();
        self.call(ctx, "fetch_bars", move |link| async move {
            link.fetch_bars(&contract, &req).await
        })
    }

    /// Earliest timestamp the terminal holds for `contract`.
    ///
    /// # Errors
    /// Connection, timeout and remote-notice errors from the call.
    pub fn head_timestamp(
        &self,
        ctx: ExecContext,
        contract: &Contract,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Result<Option<DateTime<Utc>>, BackfillError> {
        let contract = contract.clone();
        self.call(ctx, "head_timestamp", move |link| async move {
            link.head_timestamp(&contract, what_to_show, use_rth).await
        })
    }

    /// Run an arbitrary call against the link and block for its result.
    ///
    /// Out-of-band notices raised while the call ran are inspected afterwards:
    /// informational ones are dropped, a connectivity notice marks the bridge
    /// disconnected, and any other true error fails the call.
    ///
    /// # Errors
    /// `Connection` when no link can be opened, `Timeout` when the deadline
    /// passes, or whatever the call or its notices produced.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "backfill::bridge::call",
            skip(self, f),
            fields(client_id = %self.config.client_id, ctx = ?ctx),
        )
    )]
    pub fn call<T, F, Fut>(
        &self,
        ctx: ExecContext,
        operation: &'static str,
        f: F,
    ) -> Result<T, BackfillError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerLink>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BackfillError>> + Send + 'static,
    {
        let f = boxed_call(f);
        match ctx {
            ExecContext::Blocking => self.call_owned(operation, f),
            ExecContext::InsideRuntime => self.call_throwaway(operation, f),
        }
    }

    fn call_owned<T: Send + 'static>(&self, operation: &'static str, f: LinkCall<T>) -> Result<T, BackfillError> {
        // The lock covers connection state only; it is released before the call runs.
        let (link, handle) = {
            let mut inner = self.lock();
            self.ensure_locked(&mut inner)?;
            match (inner.link.clone(), inner.runtime.as_ref()) {
                (Some(link), Some(rt)) => (link, rt.handle().clone()),
                _ => return Err(BackfillError::connection("bridge has no link")),
            }
        };

        let result = run_on(&handle, self.config.call_timeout, operation, f(Arc::clone(&link)));

        let notices = link.drain_notices();
        let lost = notices
            .iter()
            .any(|n| classify(n.code) == NoticeClass::Connectivity)
            || !link.is_connected();
        let settled = settle(result, first_error(&notices));
        if lost {
            let mut inner = self.lock();
            if inner.link.as_ref().is_some_and(|current| Arc::ptr_eq(current, &link)) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    client_id = %self.config.client_id,
                    operation,
                    "link lost during call; marking bridge disconnected"
                );
                self.teardown(&mut inner);
            }
        }
        settled
    }

    fn call_throwaway<T: Send + 'static>(
        &self,
        operation: &'static str,
        f: LinkCall<T>,
    ) -> Result<T, BackfillError> {
        let slots = self.config.worker_identity_slots.max(1);
        let slot = self.next_worker_slot.fetch_add(1, Ordering::Relaxed).rem_euclid(slots);
        let client_id = self
            .config
            .client_id
            .offset(self.config.worker_identity_offset.saturating_add(slot));
        let params = ConnectParams {
            client_id,
            ..ConnectParams::from_bridge(&self.config)
        };
        let link = self.factory.create();
        let connect_timeout = self.config.connect_timeout;
        let worker_timeout = self.config.worker_timeout;

        #[cfg(feature = "tracing")]
        tracing::debug!(%client_id, operation, "running call on throwaway worker");

        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("backfill-worker-{client_id}"))
            .spawn(move || {
                let result = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| BackfillError::connection(format!("failed to start worker runtime: {e}")))
                    .and_then(|rt| {
                        rt.block_on(async move {
                            let work = async {
                                tokio::time::timeout(connect_timeout, link.connect(&params))
                                    .await
                                    .map_err(|_| BackfillError::timeout("connect", connect_timeout))??;
                                let out = f(Arc::clone(&link)).await;
                                let notices = link.drain_notices();
                                settle(out, first_error(&notices))
                            };
                            let res = tokio::time::timeout(worker_timeout, work)
                                .await
                                .unwrap_or_else(|_| Err(BackfillError::timeout(operation, worker_timeout)));
                            link.disconnect().await;
                            res
                        })
                    });
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return Err(BackfillError::connection(format!("failed to spawn worker thread: {e}")));
        }

        match rx.recv_timeout(worker_timeout + Duration::from_secs(1)) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(BackfillError::timeout(operation, worker_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BackfillError::connection(format!(
                "{operation} worker exited without a result"
            ))),
        }
    }

    fn ensure_locked(&self, inner: &mut BridgeInner) -> Result<(), BackfillError> {
        Self::refresh(inner);
        if inner.state == BridgeState::Connected {
            return Ok(());
        }
        self.teardown(inner);
        self.connect_locked(inner)
    }

    fn connect_locked(&self, inner: &mut BridgeInner) -> Result<(), BackfillError> {
        inner.state = BridgeState::Connecting;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("backfill-bridge-{}", self.config.client_id))
            .enable_all()
            .build()
            .map_err(|e| {
                inner.state = BridgeState::Disconnected;
                BackfillError::connection(format!("failed to start bridge runtime: {e}"))
            })?;

        let params = ConnectParams::from_bridge(&self.config);
        let attempts = self.config.connect_retries.max(1);
        let mut last_err = BackfillError::connection("no connect attempt made");
        for attempt in 1..=attempts {
            let link = self.factory.create();
            let connect_link = Arc::clone(&link);
            let p = params.clone();
            let res = run_on(
                runtime.handle(),
                self.config.connect_timeout,
                "connect",
                Box::pin(async move { connect_link.connect(&p).await }),
            );
            match res {
                Ok(()) => {
                    // Connect-time farm status chatter is not attributed to the first call.
                    let _ = link.drain_notices();
                    #[cfg(feature = "tracing")]
                    tracing::info!(client_id = %self.config.client_id, attempt, "bridge connected");
                    inner.link = Some(link);
                    inner.runtime = Some(runtime);
                    inner.state = BridgeState::Connected;
                    return Ok(());
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        client_id = %self.config.client_id,
                        attempt,
                        attempts,
                        error = %e,
                        "connect attempt failed"
                    );
                    last_err = e;
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }

        runtime.shutdown_background();
        inner.state = BridgeState::Disconnected;
        Err(BackfillError::connection(format!(
            "could not connect as client {} after {attempts} attempts: {last_err}",
            self.config.client_id
        )))
    }

    fn teardown(&self, inner: &mut BridgeInner) {
        if let (Some(link), Some(rt)) = (inner.link.take(), inner.runtime.as_ref()) {
            let _ = run_on(
                rt.handle(),
                self.config.call_timeout,
                "disconnect",
                Box::pin(async move {
                    link.disconnect().await;
                    Ok(())
                }),
            );
        }
        if let Some(rt) = inner.runtime.take() {
            rt.shutdown_background();
        }
        inner.state = BridgeState::Disconnected;
    }

    fn refresh(inner: &mut BridgeInner) {
        if inner.state == BridgeState::Connected
            && !inner.link.as_ref().is_some_and(|l| l.is_connected())
        {
            inner.state = BridgeState::Disconnected;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(rt) = inner.runtime.take() {
            if let Some(link) = inner.link.take() {
                let _ = run_on(
                    rt.handle(),
                    self.config.call_timeout,
                    "disconnect",
                    Box::pin(async move {
                        link.disconnect().await;
                        Ok(())
                    }),
                );
            }
            rt.shutdown_background();
        }
    }
}

/// Combine a call result with the first true error raised by notices.
fn settle<T>(result: Result<T, BackfillError>, notice_err: Option<BackfillError>) -> Result<T, BackfillError> {
    match (result, notice_err) {
        (Err(e), Some(n)) if n.is_connectivity() && !e.is_connectivity() => Err(n),
        (Err(e), _) => Err(e),
        (Ok(_), Some(n)) => Err(n),
        (Ok(v), None) => Ok(v),
    }
}

/// Spawn `fut` on `handle` and block the current thread until it finishes or
/// `timeout` passes. Timed-out tasks are aborted.
fn run_on<T: Send + 'static>(
    handle: &Handle,
    timeout: Duration,
    operation: &'static str,
    fut: BoxFuture<'static, Result<T, BackfillError>>,
) -> Result<T, BackfillError> {
    let (tx, rx) = mpsc::channel();
    let task = handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    match rx.recv_timeout(timeout) {
        Ok(res) => res,
        Err(RecvTimeoutError::Timeout) => {
            task.abort();
            Err(BackfillError::timeout(operation, timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(BackfillError::connection(format!(
            "{operation} task ended without a result"
        ))),
    }
}
