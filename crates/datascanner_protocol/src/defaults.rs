//! Canonical default values shared by every stage.

/// Rejections a message survives before it is dead-lettered.
pub const DEFAULT_REQUEUE_LIMIT: u32 = 5;
/// How long a claimed message stays invisible to other consumers.
pub const DEFAULT_LEASE_SECS: u64 = 300;
/// Messages one stage works on at the same time.
pub const DEFAULT_PREFETCH: usize = 4;
/// Idle wait between polls of an empty durable queue.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_DATABASE_FILE: &str = "datascanner.sqlite3";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
/// Scanner name of scans submitted from the command line.
pub const DEFAULT_SCANNER_NAME: &str = "manual";
