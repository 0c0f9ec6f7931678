/// Default port the server listens on for client control connections
pub const DEFAULT_CONTROL_PORT: u16 = 3000;

/// Default port the server listens on for public (end-user) connections
pub const DEFAULT_PUBLIC_PORT: u16 = 4000;

/// Maximum payload carried by a single data frame (1 KB)
pub const CHUNK_SIZE: usize = 1024;

/// Keepalive period between PING messages (60 seconds)
pub const PING_INTERVAL_MS: u64 = 60_000;

/// A control connection is considered dead after this many ping intervals without PING_OK
pub const KEEPALIVE_TIMEOUT_FACTOR: f64 = 1.5;

/// Default delay before the first reconnection attempt (1 second)
pub const RECONNECT_DEFAULT_INTERVAL_MS: u64 = 1000;

/// Once the reconnect delay grows past this ceiling it falls back to the default (15 seconds)
pub const RECONNECT_CEILING_MS: u64 = 15_000;

/// Percentage the reconnect delay grows by after each failed attempt
pub const RECONNECT_GROWTH_PERCENT: u64 = 25;

/// Length of generated session tokens and stream names (hex characters)
pub const TOKEN_LENGTH: usize = 32;

/// Session token handed out when dynamic subdomain generation is disabled
pub const STATIC_SESSION_TOKEN: &str = "sub1";

/// Host alias that reaches the host machine from inside a Docker Desktop container
pub const CONTAINER_HOST_ALIAS: &str = "host.docker.internal";

/// Capacity of the outbound frame queue of a control connection
pub const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Capacity of the per-stream queue feeding a public or local socket
pub const STREAM_QUEUE_CAPACITY: usize = 64;

/// Read buffer size for socket reads
pub const READ_BUFFER_SIZE: usize = 16 * 1024;
