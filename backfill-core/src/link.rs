use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bar::Bar;
use crate::types::{
    BackfillError, BarRequest, ClientId, ConnectParams, Contract, ContractSpec, ErrorNotice,
    WhatToShow,
};

/// One physical connection to the remote terminal.
///
/// Implementations wrap the terminal's callback-driven client. Every method
/// may take a long time; none of them may assume a caller-side timeout. Errors
/// that the terminal reports out-of-band (not as the result of a specific
/// call) are queued on a side channel and retrieved with [`drain_notices`].
///
/// [`drain_notices`]: BrokerLink::drain_notices
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Stable link implementation name for logs.
    fn name(&self) -> &'static str;

    /// Open the connection under `params.client_id`.
    ///
    /// # Errors
    /// Returns `Connection` when the terminal refuses or cannot be reached.
    async fn connect(&self, params: &ConnectParams) -> Result<(), BackfillError>;

    /// Close the connection. Must be safe to call when already closed.
    async fn disconnect(&self);

    /// Whether the link currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// Identity the link is open under, if connected.
    fn client_id(&self) -> Option<ClientId>;

    /// Ask the terminal to resolve a contract spec.
    ///
    /// Returns `Ok(None)` when the terminal answers that no such contract exists.
    async fn qualify(&self, spec: &ContractSpec) -> Result<Option<Contract>, BackfillError>;

    /// Fetch historical bars. An empty vector means the terminal had no data
    /// for the window.
    async fn fetch_bars(
        &self,
        contract: &Contract,
        req: &BarRequest,
    ) -> Result<Vec<Bar>, BackfillError>;

    /// Earliest timestamp the terminal holds data for, if it can answer.
    async fn head_timestamp(
        &self,
        contract: &Contract,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Result<Option<DateTime<Utc>>, BackfillError>;

    /// Take every queued out-of-band notice, oldest first.
    fn drain_notices(&self) -> Vec<ErrorNotice>;
}

/// Produces fresh, disconnected links.
///
/// The bridge needs a factory rather than a single link because reconnects
/// and throwaway workers each require their own physical connection.
pub trait LinkFactory: Send + Sync {
    /// Build a new disconnected link.
    fn create(&self) -> Arc<dyn BrokerLink>;
}
