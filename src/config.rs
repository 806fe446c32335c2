//! Service and runtime configuration knobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies one service and points at its source README.
///
/// `readme` is deliberately a plain string path: downstream consumers compare
/// it against the path the sandbox manager actually reads, so it never holds
/// anything richer than what `Path::display` would print.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub readme: String,
    pub port: u16,
    /// HTTP path polled for readiness, e.g. `/health`. `None` disables the
    /// health loop for this service.
    pub health_check: Option<String>,
    /// Extra environment merged into install and run child processes.
    pub env: Option<BTreeMap<String, String>>,
    /// Explicit framework name overriding dependency-based inference.
    pub target: Option<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, readme: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            readme: readme.into(),
            port,
            health_check: None,
            env: None,
            target: None,
        }
    }

    pub fn with_health_check(mut self, path: impl Into<String>) -> Self {
        self.health_check = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Bounds and location of the dependency cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache root; defaults to `<user cache dir>/pactown` and can be
    /// overridden with `PACTOWN_CACHE_DIR`.
    pub root: Option<PathBuf>,
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            max_entries: 64,
            max_total_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Resolve the effective cache root: explicit config, then the
    /// `PACTOWN_CACHE_DIR` environment variable, then the user cache dir.
    pub fn resolved_root(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.clone();
        }
        if let Ok(dir) = std::env::var("PACTOWN_CACHE_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pactown")
    }
}

/// Timing knobs for the process supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// How long to wait after SIGTERM before escalating to SIGKILL.
    pub stop_grace: Duration,
    pub health_interval: Duration,
    pub health_attempt_timeout: Duration,
    /// Consecutive failures tolerated while `Ready` before marking `Dead`.
    pub max_consecutive_failures: u32,
    /// Attempts made while `Starting` before reporting a health timeout.
    pub startup_attempts: u32,
    pub log_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            health_interval: Duration::from_millis(500),
            health_attempt_timeout: Duration::from_secs(2),
            max_consecutive_failures: 3,
            startup_attempts: 60,
            log_tail_lines: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_builders_fill_optionals() {
        let svc = ServiceConfig::new("api", "/tmp/README.md", 8001).with_health_check("/health");
        assert_eq!(svc.port, 8001);
        assert_eq!(svc.health_check.as_deref(), Some("/health"));
        assert!(svc.env.is_none());
    }

    #[test]
    fn cache_config_prefers_explicit_root() {
        let cfg = CacheConfig {
            root: Some(PathBuf::from("/somewhere/cache")),
            ..CacheConfig::default()
        };
        assert_eq!(cfg.resolved_root(), PathBuf::from("/somewhere/cache"));
    }
}
