//! A sidecar for a PostgreSQL follower that pre-reads the heap and index
//! pages WAL replay is about to touch, so replay never waits on a cold
//! page cache.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use strum_macros::{EnumString, EnumVariantNames};

pub mod agent;
pub mod db;
pub mod fhcache;
pub mod iocache;

pub mod defaults {
    pub const DEFAULT_PG_MODE: &str = "auto";
    pub const DEFAULT_CONNSTR: &str = "host=localhost user=postgres";
    pub const DEFAULT_POLL_INTERVAL: &str = "1s";
    pub const DEFAULT_IOCACHE_SIZE: usize = 65536;
    pub const DEFAULT_IOCACHE_TTL: &str = "24h";
    pub const DEFAULT_MAX_CONCURRENT_IOS: usize = 4;
    /// Four WAL segments.
    pub const DEFAULT_READAHEAD_BYTES: u64 = 64 * 1024 * 1024;
    pub const DEFAULT_FHCACHE_SIZE: usize = 1000;
}

/// How the agent decides whether the database is a primary or a follower.
/// `Auto` asks the database itself on every control-loop tick.
#[derive(EnumString, EnumVariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum PgMode {
    Primary,
    Follower,
    Auto,
}

impl PgMode {
    pub fn from_config(s: &str) -> anyhow::Result<PgMode> {
        use strum::VariantNames;
        PgMode::from_str(s).with_context(|| {
            format!(
                "Unrecognized mode. Please specify one of: {:?}",
                PgMode::VARIANTS
            )
        })
    }
}

/// Typed, immutable process configuration. Parsed once at startup and
/// passed by reference into each component.
#[derive(Debug, Clone)]
pub struct PrefaulterConf {
    pub mode: PgMode,
    /// PostgreSQL data directory.
    pub pgdata: Utf8PathBuf,
    /// Path to postmaster.pid.
    pub pid_path: Utf8PathBuf,
    /// libpq-style connection string.
    pub connstr: String,
    /// Control-loop tick interval.
    pub poll_interval: Duration,
    /// Maximum entries in the page dedup cache.
    pub iocache_size: usize,
    /// How long a dedup entry suppresses re-prefaulting its page.
    pub iocache_ttl: Duration,
    /// Number of prefault worker tasks.
    pub max_concurrent_ios: usize,
    /// Upper bound on the bytes of WAL to prefault ahead of replay.
    pub readahead_bytes: u64,
    /// Maximum number of cached open relation file descriptors.
    pub fhcache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_config() {
        assert_eq!(PgMode::from_config("primary").unwrap(), PgMode::Primary);
        assert_eq!(PgMode::from_config("follower").unwrap(), PgMode::Follower);
        assert_eq!(PgMode::from_config("auto").unwrap(), PgMode::Auto);
        assert!(PgMode::from_config("standby").is_err());
    }
}
