//! Administrative snapshots exposed to ops tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::{ClientId, Purpose};

/// One registered connection as seen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Registry key (e.g. `"gap_filler_dedicated"`).
    pub key: String,
    /// Declared purpose.
    pub purpose: Purpose,
    /// Identity the connection is open under.
    pub client_id: ClientId,
    /// Whether the link reported itself connected at snapshot time.
    pub connected: bool,
    /// Whether the connection was lent by an upstream owner.
    pub borrowed: bool,
    /// Whether the key is tracked in the temporary set.
    pub temporary: bool,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Age in whole seconds at snapshot time.
    pub age_secs: i64,
}

/// Snapshot of the allocator registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocatorStatus {
    /// Registered connections ordered by key.
    pub connections: Vec<ConnectionInfo>,
    /// Number of keys in the temporary set.
    pub temporary: usize,
    /// Instant of the most recent idle sweep, if any ran.
    pub last_sweep: Option<DateTime<Utc>>,
}

impl AllocatorStatus {
    /// Number of registered connections.
    #[must_use]
    pub fn total(&self) -> usize {
        self.connections.len()
    }

    /// Number of registered connections that reported connected.
    #[must_use]
    pub fn connected(&self) -> usize {
        self.connections.iter().filter(|c| c.connected).count()
    }
}

/// Counts describing the symbol validator cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidatorStats {
    /// Symbols that were ever successfully resolved.
    pub validated: usize,
    /// Symbols that never resolved.
    pub failed: usize,
    /// Contract records held in the cache.
    pub cached_records: usize,
    /// Cached records currently past their TTL.
    pub expired_records: usize,
}

/// Counts describing the range discovery cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeCacheStats {
    /// Entries held in the cache.
    pub entries: usize,
    /// Entries still within their TTL.
    pub fresh: usize,
    /// Entries past their TTL.
    pub expired: usize,
}
