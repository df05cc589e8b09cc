//! Timing constants for connections and the keepalive loop.

use std::time::Duration;

/// Default timeout for connection attempts.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keepalive pings once the cipher is negotiated. The
/// server drops connections that go quiet for much longer than this.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout for graceful shutdown of background tasks.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
