//! System-wide constants and defaults.

/// Default daemon endpoint when neither flag, env, nor config file set one.
pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:2375";

/// Environment variable overriding the daemon endpoint.
pub const DAEMON_URL_ENV: &str = "BERTH_DAEMON_URL";

/// Environment variable pointing at a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "BERTH_CONFIG";

/// Subject sentinel meaning "all subjects".
pub const WILDCARD_SUBJECT: &str = "*";

/// Default per-subscription delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of reconnect attempts after the event stream drops.
pub const DEFAULT_MAX_RECONNECTS: u32 = 5;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Upper bound on the delay between reconnect attempts.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

/// How often an abortable HTTP body wakes to check whether it was closed.
///
/// Also bounds the wait for the response head of such a stream.
pub const STREAM_POLL_INTERVAL_MS: u64 = 1_000;

/// Path of the daemon's lifecycle event stream.
pub const EVENTS_PATH: &str = "/events";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";
