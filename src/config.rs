//! Server configuration
//!
//! Loaded from the environment (and `.env`) once in `main`, then handed to
//! each component explicitly.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

use crate::dispatcher::ExecutionLimits;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (default: 0.0.0.0)
    pub host: String,
    /// Port to bind (default: 3001)
    pub port: u16,
    /// Directory holding the workspace files (default: ./workspace)
    pub workspace_dir: PathBuf,
    /// Front-end assets served for non-API paths
    pub static_dir: Option<PathBuf>,
    /// Replacement toolchain table
    pub languages_config: Option<PathBuf>,
    /// Run time limit in milliseconds (default: 10000ms = 10s)
    pub run_timeout_ms: u64,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_timeout_ms: u64,
    /// Bytes captured per output stream (default: 1 MiB)
    pub max_output_bytes: usize,
    /// Executions allowed in flight at once, 0 for no limit
    pub max_concurrent_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            workspace_dir: PathBuf::from("./workspace"),
            static_dir: None,
            languages_config: None,
            run_timeout_ms: 10_000,
            compile_timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024,
            max_concurrent_runs: 0,
        }
    }
}

impl ServerConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port),
            workspace_dir: text("WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            static_dir: text("STATIC_DIR").map(PathBuf::from),
            languages_config: text("LANGUAGES_CONFIG").map(PathBuf::from),
            run_timeout_ms: parse_or(&lookup, "RUN_TIMEOUT_MS", defaults.run_timeout_ms),
            compile_timeout_ms: parse_or(&lookup, "COMPILE_TIMEOUT_MS", defaults.compile_timeout_ms),
            max_output_bytes: parse_or(&lookup, "MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            max_concurrent_runs: parse_or(
                &lookup,
                "MAX_CONCURRENT_RUNS",
                defaults.max_concurrent_runs,
            ),
        }
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            compile_timeout: Duration::from_millis(self.compile_timeout_ms),
            run_timeout: Duration::from_millis(self.run_timeout_ms),
            max_output_bytes: self.max_output_bytes,
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid HOST: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
    }
}
