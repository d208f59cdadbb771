//! Purpose-based allocation and recycling of terminal connections.
//!
//! Every connection lives in one registry keyed by a purpose key. Long-lived
//! purposes map to a single fixed key; short-lived ones get a fresh key per
//! call and are also tracked in a temporary set for bulk cleanup.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backfill_core::{
    AllocatorConfig, AllocatorStatus, BackfillError, BridgeConfig, ClientId, Clock,
    ConnectionInfo, LinkFactory, Purpose, SystemClock,
};
use chrono::{DateTime, Utc};

use crate::bridge::SyncBridge;

/// Registry key of the interactive API singleton.
pub const API_SINGLETON_KEY: &str = "api_singleton";

/// One connection handed out by the allocator.
#[derive(Clone)]
pub struct ManagedConnection {
    /// Identity the connection is open under.
    pub client_id: ClientId,
    /// Declared purpose.
    pub purpose: Purpose,
    /// Registry key.
    pub key: String,
    /// The bridge itself.
    pub bridge: Arc<SyncBridge>,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
    /// Lent by an upstream owner; never disconnected by the allocator.
    pub borrowed: bool,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("client_id", &self.client_id)
            .field("purpose", &self.purpose)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("borrowed", &self.borrowed)
            .finish_non_exhaustive()
    }
}

/// A longer-lived owner that can lend its connection for API calls.
pub trait UpstreamConnections: Send + Sync {
    /// A connected bridge to lend, if the owner has one.
    fn connected_bridge(&self) -> Option<Arc<SyncBridge>>;
}

/// Where a long-lived service gets the bridge for its next call.
#[derive(Clone)]
pub enum BridgeSource {
    /// Always the same bridge; it reconnects itself under its own identity.
    Fixed(Arc<SyncBridge>),
    /// Whatever the allocator currently registers for a dedicated purpose.
    ///
    /// A dropped connection is replaced by the allocator, so the service
    /// never keeps an identity the registry has forgotten.
    Allocated {
        /// Registry to acquire from.
        allocator: Arc<ConnectionAllocator>,
        /// Dedicated purpose to acquire.
        purpose: Purpose,
    },
}

impl BridgeSource {
    /// Source backed by the allocator's connection for `purpose`.
    ///
    /// # Errors
    /// `Validation` for temporary purposes, which would open a new connection
    /// on every call.
    pub fn allocated(allocator: Arc<ConnectionAllocator>, purpose: Purpose) -> Result<Self, BackfillError> {
        if purpose.is_temporary() {
            return Err(BackfillError::validation(format!(
                "{purpose} connections are temporary and cannot back a service"
            )));
        }
        Ok(Self::Allocated { allocator, purpose })
    }

    /// Bridge to issue the next call on.
    ///
    /// # Errors
    /// `Connection` when the allocator cannot provide a connected bridge.
    pub fn bridge(&self) -> Result<Arc<SyncBridge>, BackfillError> {
        match self {
            Self::Fixed(bridge) => Ok(Arc::clone(bridge)),
            Self::Allocated { allocator, purpose } => {
                allocator.acquire(*purpose, None).map(|conn| conn.bridge)
            }
        }
    }
}

impl From<Arc<SyncBridge>> for BridgeSource {
    fn from(bridge: Arc<SyncBridge>) -> Self {
        Self::Fixed(bridge)
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, ManagedConnection>,
    temporary: HashMap<String, DateTime<Utc>>,
    cursors: HashMap<Purpose, i32>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Assigns and recycles bridges by purpose.
pub struct ConnectionAllocator {
    bridge_template: BridgeConfig,
    config: AllocatorConfig,
    factory: Arc<dyn LinkFactory>,
    clock: Arc<dyn Clock>,
    upstream: Option<Arc<dyn UpstreamConnections>>,
    registry: Mutex<Registry>,
    seq: AtomicU64,
}

impl ConnectionAllocator {
    /// Allocator opening links from `factory` with settings from `bridge_template`.
    #[must_use]
    pub fn new(
        bridge_template: BridgeConfig,
        config: AllocatorConfig,
        factory: Arc<dyn LinkFactory>,
    ) -> Self {
        Self {
            bridge_template,
            config,
            factory,
            clock: Arc::new(SystemClock),
            upstream: None,
            registry: Mutex::new(Registry::default()),
            seq: AtomicU64::new(0),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lend API-call connections from `upstream` when it has one connected.
    #[must_use]
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamConnections>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Allocator configuration.
    #[must_use]
    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Registry key for `purpose`.
    ///
    /// Batch keys use `operation_id` when given; every other temporary key is
    /// unique per call and embeds its creation time in milliseconds.
    #[must_use]
    pub fn key_for(&self, purpose: Purpose, operation_id: Option<&str>) -> String {
        match purpose {
            Purpose::ApiCall => API_SINGLETON_KEY.to_string(),
            Purpose::GapFiller => "gap_filler_dedicated".to_string(),
            Purpose::SymbolValidation => "symbol_validation_dedicated".to_string(),
            Purpose::DataManager => "data_manager_dedicated".to_string(),
            Purpose::Batch => match operation_id {
                Some(id) => format!("batch_{id}"),
                None => self.unique_key("batch"),
            },
            Purpose::Cli => self.unique_key("cli"),
            Purpose::Test => self.unique_key("test"),
        }
    }

    fn unique_key(&self, prefix: &str) -> String {
        let ms = self.clock.now().timestamp_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{ms}_{seq}")
    }

    /// Get a connected connection for `purpose`.
    ///
    /// A registered connection that is still connected is reused as is. One
    /// that dropped is torn down and replaced under a fresh identity.
    ///
    /// # Errors
    /// Returns `Connection` when a new bridge cannot connect.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "backfill::allocator::acquire",
            skip(self),
            fields(purpose = %purpose),
        )
    )]
    pub fn acquire(
        &self,
        purpose: Purpose,
        operation_id: Option<&str>,
    ) -> Result<ManagedConnection, BackfillError> {
        let key = self.key_for(purpose, operation_id);
        let mut reg = self.lock();

        if let Some(existing) = reg.connections.get(&key) {
            if existing.bridge.is_connected() {
                return Ok(existing.clone());
            }
            if let Some(stale) = reg.connections.remove(&key) {
                #[cfg(feature = "tracing")]
                tracing::info!(key = %key, client_id = %stale.client_id, "tearing down stale connection");
                if !stale.borrowed {
                    stale.bridge.disconnect();
                }
            }
            reg.temporary.remove(&key);
        }

        let now = self.clock.now();
        if purpose == Purpose::ApiCall {
            if let Some(bridge) = self
                .upstream
                .as_ref()
                .and_then(|u| u.connected_bridge())
                .filter(|b| b.is_connected())
            {
                let conn = ManagedConnection {
                    client_id: bridge.client_id(),
                    purpose,
                    key: key.clone(),
                    bridge,
                    created_at: now,
                    borrowed: true,
                };
                reg.connections.insert(key, conn.clone());
                return Ok(conn);
            }
        }

        let client_id = self.allocate_identity(&mut reg, purpose);
        let bridge = SyncBridge::connect(
            self.bridge_template.with_client_id(client_id),
            Arc::clone(&self.factory),
        )?;
        let conn = ManagedConnection {
            client_id,
            purpose,
            key: key.clone(),
            bridge: Arc::new(bridge),
            created_at: now,
            borrowed: false,
        };
        if purpose.is_temporary() {
            reg.temporary.insert(key.clone(), now);
        }
        reg.connections.insert(key, conn.clone());
        #[cfg(feature = "tracing")]
        tracing::debug!(key = %conn.key, client_id = %client_id, "connection registered");
        Ok(conn)
    }

    /// Acquire a connection that is released when the lease drops, if its
    /// purpose is temporary.
    ///
    /// # Errors
    /// Same as [`acquire`](Self::acquire).
    pub fn acquire_scoped(
        &self,
        purpose: Purpose,
        operation_id: Option<&str>,
    ) -> Result<ConnectionLease<'_>, BackfillError> {
        let conn = self.acquire(purpose, operation_id)?;
        Ok(ConnectionLease {
            allocator: self,
            conn,
        })
    }

    /// Pick an identity from the purpose's range, rotating past identities in
    /// use. An exhausted range degrades to `fallback_base + registry size`.
    fn allocate_identity(&self, reg: &mut Registry, purpose: Purpose) -> ClientId {
        let in_use: HashSet<i32> = reg
            .connections
            .values()
            .map(|c| c.client_id.get())
            .collect();
        let range = self.config.range_for(purpose);
        let len = range.len();
        let cursor = reg.cursors.get(&purpose).copied().unwrap_or(range.first);
        let start = (cursor - range.first).rem_euclid(len);
        for i in 0..len {
            let candidate = range.first + (start + i) % len;
            if !in_use.contains(&candidate) {
                reg.cursors.insert(purpose, candidate + 1);
                return ClientId(candidate);
            }
        }

        let size = i32::try_from(reg.connections.len()).unwrap_or(i32::MAX);
        let mut candidate = self.config.fallback_base.saturating_add(size);
        while in_use.contains(&candidate) {
            candidate = candidate.saturating_add(1);
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(purpose = %purpose, client_id = candidate, "identity range exhausted; using fallback identity");
        ClientId(candidate)
    }

    /// Release temporary connections of `purpose`.
    ///
    /// With an `operation_id`, only the matching key is released: for batches
    /// the id is the batch id, otherwise it is the full registry key. Without
    /// one, every temporary connection of that purpose goes. Returns how many
    /// connections were released.
    pub fn release_temporary(&self, purpose: Purpose, operation_id: Option<&str>) -> usize {
        if !purpose.is_temporary() {
            return 0;
        }
        let keys: Vec<String> = match operation_id {
            Some(id) if purpose == Purpose::Batch && !id.starts_with("batch_") => {
                vec![format!("batch_{id}")]
            }
            Some(key) => vec![key.to_string()],
            None => {
                let prefix = format!("{}_", purpose.as_str());
                self.lock()
                    .temporary
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect()
            }
        };
        keys.iter().filter(|k| self.release_key(k)).count()
    }

    /// Remove and disconnect the connection under `key`. Returns whether one
    /// was registered.
    pub fn release_key(&self, key: &str) -> bool {
        let removed = {
            let mut reg = self.lock();
            reg.temporary.remove(key);
            reg.connections.remove(key)
        };
        match removed {
            Some(conn) => {
                Self::close(&conn);
                true
            }
            None => false,
        }
    }

    /// Tear down temporary connections older than `max_idle`.
    ///
    /// Runs at most once per configured sweep interval; calls inside the
    /// interval return 0 without inspecting anything. Dedicated and singleton
    /// connections are never swept.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "backfill::allocator::sweep_idle", skip(self))
    )]
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let removed: Vec<ManagedConnection> = {
            let mut reg = self.lock();
            if let Some(last) = reg.last_sweep {
                let interval = chrono::Duration::from_std(self.config.sweep_interval)
                    .unwrap_or(chrono::Duration::MAX);
                if now - last < interval {
                    return 0;
                }
            }
            reg.last_sweep = Some(now);

            let expired: Vec<String> = reg
                .temporary
                .iter()
                .filter(|(key, recorded)| {
                    let created = key_timestamp(key).unwrap_or(**recorded);
                    now - created > max_idle
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .iter()
                .filter_map(|key| {
                    reg.temporary.remove(key);
                    reg.connections.remove(key)
                })
                .collect()
        };
        for conn in &removed {
            #[cfg(feature = "tracing")]
            tracing::info!(key = %conn.key, client_id = %conn.client_id, "sweeping idle connection");
            Self::close(conn);
        }
        removed.len()
    }

    /// Disconnect and forget every connection. Returns how many were removed.
    pub fn release_all(&self) -> usize {
        let removed: Vec<ManagedConnection> = {
            let mut reg = self.lock();
            reg.temporary.clear();
            reg.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &removed {
            Self::close(conn);
        }
        removed.len()
    }

    /// Administrative alias for [`release_all`](Self::release_all).
    pub fn force_cleanup(&self) -> usize {
        self.release_all()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Snapshot of the registry.
    #[must_use]
    pub fn status(&self) -> AllocatorStatus {
        let now = self.clock.now();
        let reg = self.lock();
        let mut connections: Vec<ConnectionInfo> = reg
            .connections
            .values()
            .map(|c| ConnectionInfo {
                key: c.key.clone(),
                purpose: c.purpose,
                client_id: c.client_id,
                connected: c.bridge.is_connected(),
                borrowed: c.borrowed,
                temporary: reg.temporary.contains_key(&c.key),
                created_at: c.created_at,
                age_secs: (now - c.created_at).num_seconds(),
            })
            .collect();
        connections.sort_by(|a, b| a.key.cmp(&b.key));
        AllocatorStatus {
            connections,
            temporary: reg.temporary.len(),
            last_sweep: reg.last_sweep,
        }
    }

    fn close(conn: &ManagedConnection) {
        if !conn.borrowed {
            conn.bridge.disconnect();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creation time embedded in a generated `cli_`/`test_` key.
fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let rest = key
        .strip_prefix("cli_")
        .or_else(|| key.strip_prefix("test_"))?;
    let (ms, seq) = rest.split_once('_')?;
    seq.parse::<u64>().ok()?;
    DateTime::from_timestamp_millis(ms.parse().ok()?)
}

/// A connection held for the lifetime of a scope.
///
/// Dropping the lease releases the connection when its purpose is temporary;
/// shared connections stay registered.
pub struct ConnectionLease<'a> {
    allocator: &'a ConnectionAllocator,
    conn: ManagedConnection,
}

impl Deref for ConnectionLease<'_> {
    type Target = ManagedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if self.conn.purpose.is_temporary() {
            self.allocator.release_key(&self.conn.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_carry_their_timestamp() {
        let ts = key_timestamp("cli_1700000000000_4").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
        assert!(key_timestamp("test_abc_1").is_none());
        assert!(key_timestamp("batch_1700000000000_1").is_none());
        assert!(key_timestamp("gap_filler_dedicated").is_none());
    }
}
