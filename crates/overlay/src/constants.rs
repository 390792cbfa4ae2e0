use std::time::Duration;

/// The default timeout for a complete recursive query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The default timeout for a single PING request.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(500);

/// The default timeout for a single non-PING request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// The default period of the routing table revalidation loop.
pub const DEFAULT_REVALIDATION_INTERVAL: Duration = Duration::from_secs(5);

/// The default cap on concurrent stream transfers in each direction.
pub const DEFAULT_TRANSFER_LIMIT: usize = 50;

/// The default per-peer inbound offer budget (token bucket capacity).
pub const DEFAULT_OFFER_RATE_CAPACITY: f64 = 8.0;

/// The default per-peer inbound offer refill rate, in tokens per second.
pub const DEFAULT_OFFER_RATE_PER_SEC: f64 = 2.0;
