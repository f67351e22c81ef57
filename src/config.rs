//! Process-wide settings (component #10, spec.md §2).
//!
//! `Configuration` is a plain value type, the same shape as
//! `fusillade::daemon::DaemonConfig`: a `Default` impl with sensible
//! defaults, and every field overridable by construction. A process-wide
//! default is available through [`Configuration::global`] /
//! [`Configuration::set_global`] for callers that don't want to thread a
//! value through every constructor, but it is never the only way to get
//! one (§9 "prefer an explicit Environment, keep the global only as a
//! convenience default").

use std::path::PathBuf;
use std::sync::OnceLock;

/// Process-wide settings read by storage, the request queue, session
/// pool, snapshotter and crawler core loop.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Root directory for the on-disk storage backend.
    /// Overridden by `CRAWLEE_STORAGE_DIR`.
    pub storage_dir: PathBuf,

    /// Default bound for operations wrapped in `addTimeoutToPromise`-style
    /// waits (lease, acquire-session, mark-handled). Overridden by
    /// `CRAWLEE_INTERNAL_TIMEOUT`.
    pub internal_timeout_millis: u64,

    /// Container total-memory override, in megabytes. Overridden by
    /// `CRAWLEE_MEMORY_MBYTES`.
    pub memory_mbytes: Option<u64>,

    /// When true, retries log full error chains rather than a single
    /// line. Overridden by `CRAWLEE_VERBOSE_LOG`.
    pub verbose_log: bool,

    /// `STORAGE_CONSISTENCY_DELAY_MILLIS` (§4.2).
    pub storage_consistency_delay_millis: u64,

    /// `API_PROCESSED_REQUESTS_DELAY_MILLIS` (§4.2).
    pub api_processed_requests_delay_millis: u64,

    /// `QUERY_HEAD_MIN_LENGTH` (§4.2).
    pub query_head_min_length: usize,

    /// `SAFE_MIGRATION_WAIT_MILLIS` (§5).
    pub safe_migration_wait_millis: u64,

    /// Dedup LRU cache capacity (§4.2).
    pub dedup_cache_capacity: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./storage"),
            internal_timeout_millis: 5 * 60 * 1000,
            memory_mbytes: None,
            verbose_log: false,
            storage_consistency_delay_millis: 50,
            api_processed_requests_delay_millis: 10_000,
            query_head_min_length: 100,
            safe_migration_wait_millis: 20_000,
            dedup_cache_capacity: 1000,
        }
    }
}

impl Configuration {
    /// Build a `Configuration` from defaults overlaid with the environment
    /// variables of spec.md §6. Unset or unparsable variables fall back to
    /// the default for that field; this never fails.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CRAWLEE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("CRAWLEE_INTERNAL_TIMEOUT") {
            if let Ok(millis) = raw.parse::<u64>() {
                config.internal_timeout_millis = millis;
            } else if let Ok(duration) = humantime::parse_duration(&raw) {
                config.internal_timeout_millis = duration.as_millis() as u64;
            } else {
                tracing::warn!(value = %raw, "could not parse CRAWLEE_INTERNAL_TIMEOUT, ignoring");
            }
        }
        if let Ok(raw) = std::env::var("CRAWLEE_MEMORY_MBYTES") {
            match raw.parse::<u64>() {
                Ok(mbytes) => config.memory_mbytes = Some(mbytes),
                Err(_) => tracing::warn!(value = %raw, "could not parse CRAWLEE_MEMORY_MBYTES, ignoring"),
            }
        }
        if let Ok(raw) = std::env::var("CRAWLEE_VERBOSE_LOG") {
            config.verbose_log = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        config
    }

    /// The process-wide default configuration, lazily initialized from
    /// the environment on first access.
    pub fn global() -> &'static Configuration {
        static GLOBAL: OnceLock<Configuration> = OnceLock::new();
        GLOBAL.get_or_init(Configuration::from_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Configuration::default();
        assert_eq!(config.storage_consistency_delay_millis, 50);
        assert_eq!(config.api_processed_requests_delay_millis, 10_000);
    }

    #[test]
    fn from_env_ignores_unset_vars() {
        std::env::remove_var("CRAWLEE_STORAGE_DIR");
        let config = Configuration::from_env();
        assert_eq!(config.storage_dir, PathBuf::from("./storage"));
    }

    #[test]
    fn from_env_reads_memory_override() {
        std::env::set_var("CRAWLEE_MEMORY_MBYTES", "2048");
        let config = Configuration::from_env();
        assert_eq!(config.memory_mbytes, Some(2048));
        std::env::remove_var("CRAWLEE_MEMORY_MBYTES");
    }
}
