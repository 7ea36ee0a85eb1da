//! Configuration handling for the kcpmux binary.
//!
//! Values are layered: built-in defaults, then the optional YAML file, then
//! `KCPMUX_*` environment variables, then command-line flags (applied by
//! `main`).

use anyhow::{Context, Result};
use mux_session::SessionConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the keepalive interval (seconds)
pub const ENV_KEEPALIVE_SECS: &str = "KCPMUX_KEEPALIVE_SECS";
/// Environment variable overriding the idle timeout (seconds)
pub const ENV_IDLE_TIMEOUT_SECS: &str = "KCPMUX_IDLE_TIMEOUT_SECS";
/// Environment variable overriding the handshake timeout (milliseconds)
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "KCPMUX_HANDSHAKE_TIMEOUT_MS";

/// kcpmux configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KcpmuxConfig {
    /// Settings applied to every session
    pub session: SessionConfig,
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RootConfig {
    session: Option<SessionConfig>,
}

impl KcpmuxConfig {
    /// Load the YAML file (if any) and apply environment overrides
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_environment_overrides(|key| std::env::var(key).ok());
        config.log_summary();
        Ok(config)
    }

    /// Read the `session:` section of a YAML file; a missing file means defaults
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                return Ok(Self::default());
            }
        };

        let root: RootConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        let config = Self {
            session: root.session.unwrap_or_default(),
        };
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `KCPMUX_*` overrides read through `lookup`
    pub fn apply_environment_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_env::<i64, _>(&lookup, ENV_KEEPALIVE_SECS) {
            self.session.keepalive_interval_secs = secs;
            info!("Keepalive interval overridden by environment: {}s", secs);
        }
        if let Some(secs) = parse_env::<u64, _>(&lookup, ENV_IDLE_TIMEOUT_SECS) {
            self.session.idle_timeout_secs = secs;
            info!("Idle timeout overridden by environment: {}s", secs);
        }
        if let Some(ms) = parse_env::<u64, _>(&lookup, ENV_HANDSHAKE_TIMEOUT_MS) {
            self.session.handshake_timeout_ms = ms;
            info!("Handshake timeout overridden by environment: {}ms", ms);
        }
    }

    /// Apply command-line overrides; a zero keepalive disables keepalives
    pub fn apply_cli_overrides(
        &mut self,
        keepalive: Option<Duration>,
        idle_timeout: Option<Duration>,
    ) {
        if let Some(keepalive) = keepalive {
            self.session.keepalive_interval_secs =
                i64::try_from(keepalive.as_secs()).unwrap_or(i64::MAX);
        }
        if let Some(idle_timeout) = idle_timeout {
            self.session.idle_timeout_secs = idle_timeout.as_secs();
        }
    }

    fn log_summary(&self) {
        let session = &self.session;
        info!(
            "Session config: keepalive={}s, idle_timeout={}s, drain_timeout={}s, handshake_timeout={}ms, mtu={}",
            session.keepalive_interval_secs,
            session.idle_timeout_secs,
            session.drain_timeout_secs,
            session.handshake_timeout_ms,
            session.engine.mtu
        );
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
