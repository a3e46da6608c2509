use std::time::Duration;

/// Sleep between event-poll iterations that returned at least one log.
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Back-off applied when an event poll comes back empty.
pub const EVENT_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for any single view call against the node.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often we re-check for a transaction receipt while waiting for it to
/// be mined.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Number of block timestamps kept in the per-client cache.
pub const BLOCK_TIMESTAMP_CACHE_SIZE: usize = 512;

/// Capacity of each store listener queue. A listener that falls this far
/// behind starts losing notifications rather than stalling mutators.
pub const LISTENER_QUEUE_CAPACITY: usize = 256;

/// WebSocket snapshot limits.
pub const SNAPSHOT_HISTORY_LIMIT: usize = 10;
pub const SNAPSHOT_FEED_LIMIT: usize = 20;

/// REST `limit` query param ceiling.
pub const MAX_QUERY_LIMIT: usize = 200;
