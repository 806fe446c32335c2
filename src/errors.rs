//! Error kinds shared across the pipeline.
//!
//! Library code returns `PactownError` so callers can branch on the failure
//! class; the CLI binary wraps everything in `anyhow` at the edge.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PactownError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PactownError {
    /// Malformed fence or missing required metadata, with the 1-based line
    /// number of the offending fence.
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Dependency install subprocess exited non-zero.
    #[error("{runtime} dependency install failed: {message}")]
    DependencyInstall { runtime: String, message: String },

    /// Cache entry missing its marker or otherwise unusable; the entry has
    /// been quarantined and the caller should fall back to a full install.
    #[error("cache entry {fingerprint} corrupt: {message}")]
    CacheCorruption { fingerprint: String, message: String },

    /// Child failed to start or exited before becoming healthy.
    #[error("failed to spawn service: {0}")]
    Spawn(String),

    /// Health checks exhausted without a 2xx response.
    #[error("health check on port {port} timed out after {attempts} attempts")]
    HealthTimeout { port: u16, attempts: u32 },

    /// Security policy rejected the start request.
    #[error("start denied: {reason}")]
    PolicyDenied {
        reason: String,
        delay_seconds: Option<f64>,
    },

    #[error("{}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PactownError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable slug identifying the failure class in structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::DependencyInstall { .. } => "dependency_install",
            Self::CacheCorruption { .. } => "cache_corruption",
            Self::Spawn(_) => "spawn",
            Self::HealthTimeout { .. } => "health_timeout",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::Io { .. } => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_carry_line_numbers() {
        let err = PactownError::Parse {
            line: 7,
            message: "unclosed fence".into(),
        };
        assert!(err.to_string().contains("line 7"));
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn policy_denials_keep_the_retry_hint() {
        let err = PactownError::PolicyDenied {
            reason: "rate limited".into(),
            delay_seconds: Some(4.5),
        };
        match err {
            PactownError::PolicyDenied { delay_seconds, .. } => {
                assert_eq!(delay_seconds, Some(4.5));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
