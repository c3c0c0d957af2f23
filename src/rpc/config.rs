use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::{Id, RoutingSettings};

/// Default number of concurrent queries per lookup.
pub const DEFAULT_ALPHA: usize = 3;
/// Default request timeout before abandoning a query to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Default upper bound on how long the dispatch loop waits for an event.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default interval between checks for stale buckets.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Routing tree parameters: `k`, error threshold, split depth limit,
    /// key space width and refresh interval.
    pub routing: RoutingSettings,
    /// Number of queries a lookup keeps in flight.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// How long to wait for a reply before counting the query as failed.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How long the dispatch loop blocks waiting for a command or a datagram
    /// before running maintenance.
    ///
    /// Defaults to [DEFAULT_POLL_INTERVAL]
    pub poll_interval: Duration,
    /// Minimum time between two refreshes of stale buckets.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// Explicit node Id.
    ///
    /// Defaults to None, where a random Id within the key space is used.
    pub id: Option<Id>,
    /// Explicit address to bind the UDP transport to.
    ///
    /// Defaults to None, where `0.0.0.0:0` is used.
    pub bind_address: Option<SocketAddrV4>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing: RoutingSettings::default(),
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            id: None,
            bind_address: None,
        }
    }
}
