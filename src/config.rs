use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::pool::PoolConfig;
use crate::sandbox::runtime::RuntimeConfig;
use crate::sandbox::types::{ProviderConfig, ProviderType};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Skip strong isolation and run everything on the native provider.
    pub dev_mode: bool,
    pub pool: PoolConfig,
    /// Persisted provider selection, see [`SandboxSettings`].
    pub settings_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let environment = std::env::var("WARDEN_ENV")
            .or_else(|_| std::env::var("ENVIRONMENT"))
            .ok();
        Self::from_raw_values(
            environment.as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("WARDEN_DEV_MODE").ok().as_deref(),
            std::env::var("WARDEN_POOL_MAX_SIZE").ok().as_deref(),
            std::env::var("WARDEN_POOL_IDLE_TTL_SECS").ok().as_deref(),
            std::env::var("WARDEN_POOL_ACQUIRE_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("WARDEN_SETTINGS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        environment: Option<&str>,
        sentry_dsn: Option<&str>,
        dev_mode: Option<&str>,
        pool_max_size: Option<&str>,
        pool_idle_ttl_secs: Option<&str>,
        pool_acquire_timeout_secs: Option<&str>,
        settings_path: Option<&str>,
    ) -> Self {
        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let dev_mode = dev_mode.map(is_truthy).unwrap_or(false) || environment == "development";

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_size: pool_max_size
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_size),
            idle_ttl: parse_secs(pool_idle_ttl_secs).unwrap_or(defaults.idle_ttl),
            acquire_timeout: parse_secs(pool_acquire_timeout_secs)
                .unwrap_or(defaults.acquire_timeout),
            sweep_interval: defaults.sweep_interval,
        };

        let settings_path = settings_path
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_settings_path);

        Config {
            sentry_dsn,
            environment,
            dev_mode,
            pool,
            settings_path,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            dev_mode: self.dev_mode,
            pool: self.pool.clone(),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_secs(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
        .join("settings.yaml")
}

/// Externally persisted sandbox settings, synced into the runtime with
/// `SandboxRuntime::sync_settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub provider: ProviderType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: ProviderConfig,
}

fn default_enabled() -> bool {
    true
}

impl SandboxSettings {
    /// Read settings from YAML. A missing file means nothing was persisted.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(settings))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self).context("failed to serialize settings")?;
        std::fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))
    }
}
