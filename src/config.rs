//! Service configuration for crossdiff.
//!
//! All tunables live in [`Settings`], loaded from an optional TOML file and
//! overridable per-field by CLI flags. Defaults match the documented
//! resource model: pool acquire 30s, query 5min, persist 60s, four
//! concurrent jobs system-wide.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiffError;

/// Segment size below which the hash-diff stops recursing and performs a
/// direct row comparison.
pub const DEFAULT_BISECTION_THRESHOLD: u64 = 16_384;

/// Number of child segments each recursive bisection step produces.
pub const DEFAULT_BISECTION_FACTOR: usize = 32;

/// System-wide ceiling on concurrently running comparison jobs.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Top-level service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Listen address for the HTTP control plane.
    pub listen: String,

    /// URL of the result store (`sqlite://…` or `postgres://…`).
    pub store_url: String,

    /// Maximum number of comparison jobs running at once.
    pub max_concurrent_jobs: usize,

    /// Per-descriptor connection pool ceiling.
    pub pool_max_connections: u32,

    /// Seconds to wait for a pooled connection before `PoolExhausted`.
    pub pool_acquire_timeout_secs: u64,

    /// Seconds to wait for a single SQL round trip.
    pub query_timeout_secs: u64,

    /// Seconds to wait for a diff-row batch write to the result store.
    pub persist_timeout_secs: u64,

    /// Default bisection threshold for hash-diff jobs.
    pub bisection_threshold: u64,

    /// Default bisection factor for hash-diff jobs.
    pub bisection_factor: usize,

    /// Default per-job worker budget when the request does not set
    /// `threads`. Clamped to `min(8, 2 * cores)` at job start.
    pub default_threads: usize,

    /// Default numeric tolerance for lossy float comparisons.
    pub default_tolerance: f64,

    /// Rows per diff batch sent from the comparison workers to the
    /// persistence writer.
    pub diff_batch_size: usize,

    /// Refuse non-read statements on the raw query endpoint.
    pub read_only_queries: bool,

    /// Emit logs as JSON instead of human-readable lines.
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8742".to_string(),
            store_url: "sqlite://crossdiff.db".to_string(),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            pool_max_connections: 8,
            pool_acquire_timeout_secs: 30,
            query_timeout_secs: 300,
            persist_timeout_secs: 60,
            bisection_threshold: DEFAULT_BISECTION_THRESHOLD,
            bisection_factor: DEFAULT_BISECTION_FACTOR,
            default_threads: 0, // 0 = auto: min(8, 2 * cores)
            default_tolerance: 1e-3,
            diff_batch_size: 1_000,
            read_only_queries: true,
            log_json: false,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, DiffError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            DiffError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|e| {
            DiffError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), DiffError> {
        if self.max_concurrent_jobs == 0 {
            return Err(DiffError::InvalidConfig(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.bisection_factor < 2 {
            return Err(DiffError::InvalidConfig(
                "bisection_factor must be at least 2".into(),
            ));
        }
        if self.bisection_threshold == 0 {
            return Err(DiffError::InvalidConfig(
                "bisection_threshold must be at least 1".into(),
            ));
        }
        if self.diff_batch_size == 0 {
            return Err(DiffError::InvalidConfig(
                "diff_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolved per-job worker budget: explicit request value, else the
    /// configured default, else `min(8, 2 * cores)`.
    pub fn resolve_threads(&self, requested: Option<usize>) -> usize {
        let auto = usize::min(
            8,
            2 * std::thread::available_parallelism().map_or(4, |p| p.get()),
        );
        match requested {
            Some(n) if n > 0 => n,
            _ if self.default_threads > 0 => self.default_threads,
            _ => auto,
        }
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.bisection_threshold, 16_384);
        assert_eq!(s.bisection_factor, 32);
        assert_eq!(s.max_concurrent_jobs, 4);
        assert_eq!(s.pool_acquire_timeout(), Duration::from_secs(30));
        assert_eq!(s.query_timeout(), Duration::from_secs(300));
        assert_eq!(s.persist_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_jobs() {
        let s = Settings {
            max_concurrent_jobs: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_factor() {
        let s = Settings {
            bisection_factor: 1,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_resolve_threads_prefers_explicit() {
        let s = Settings::default();
        assert_eq!(s.resolve_threads(Some(3)), 3);
        // Explicit zero falls back to auto, which is clamped to [1, 8].
        let auto = s.resolve_threads(Some(0));
        assert!((1..=8).contains(&auto));
    }

    #[test]
    fn test_resolve_threads_configured_default() {
        let s = Settings {
            default_threads: 5,
            ..Settings::default()
        };
        assert_eq!(s.resolve_threads(None), 5);
    }

    #[test]
    fn test_toml_round_trip() {
        let s = Settings::default();
        let text = toml::to_string(&s).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.listen, s.listen);
        assert_eq!(back.bisection_threshold, s.bisection_threshold);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = toml::from_str::<Settings>("no_such_setting = 1");
        assert!(err.is_err());
    }
}
