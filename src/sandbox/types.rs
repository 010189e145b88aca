use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Provider identity ───────────────────────────────────────────────

/// Open identifier for a sandbox backend.
///
/// The well-known values are associated constants; any other string names a
/// third-party plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderType(Cow<'static, str>);

impl ProviderType {
    pub const NATIVE: ProviderType = ProviderType(Cow::Borrowed("native"));
    pub const DOCKER: ProviderType = ProviderType(Cow::Borrowed("docker"));
    pub const BOXLITE: ProviderType = ProviderType(Cow::Borrowed("boxlite"));
    pub const E2B: ProviderType = ProviderType(Cow::Borrowed("e2b"));

    pub fn new(value: impl Into<String>) -> Self {
        Self(Cow::Owned(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ── Capabilities ────────────────────────────────────────────────────

/// Strength of containment, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Vm,
    Container,
    Process,
    None,
}

impl IsolationLevel {
    pub fn strength(self) -> u8 {
        match self {
            IsolationLevel::Vm => 3,
            IsolationLevel::Container => 2,
            IsolationLevel::Process => 1,
            IsolationLevel::None => 0,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationLevel::Vm => "vm",
            IsolationLevel::Container => "container",
            IsolationLevel::Process => "process",
            IsolationLevel::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub isolation_level: IsolationLevel,
    pub supports_volume_mounts: bool,
    pub supports_networking: bool,
    pub supports_pooling: bool,
    pub supported_runtimes: BTreeSet<String>,
}

impl Capabilities {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self {
            isolation_level,
            supports_volume_mounts: false,
            supports_networking: false,
            supports_pooling: false,
            supported_runtimes: BTreeSet::new(),
        }
    }

    pub fn with_runtimes<I, S>(mut self, runtimes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_runtimes = runtimes.into_iter().map(Into::into).collect();
        self
    }
}

// ── Metadata ────────────────────────────────────────────────────────

/// Descriptive record for a registered plugin. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub name: String,
    pub version: String,
    pub description: String,
    /// JSON-schema-like description of the accepted `ProviderConfig`.
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    #[serde(flatten)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
    /// Availability includes the expensive, memoized correctness probe.
    #[serde(default)]
    pub requires_verification: bool,
}

/// Provider-specific configuration, always a JSON object.
pub type ProviderConfig = serde_json::Map<String, serde_json::Value>;

/// Stable string form of a config. Keys are sorted, so equal configs give
/// equal fingerprints.
pub fn config_fingerprint(config: &ProviderConfig) -> String {
    serde_json::Value::Object(config.clone()).to_string()
}

// ── Exec model ──────────────────────────────────────────────────────

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code reported when the command could not be started.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Exit code reported when the command was killed on timeout.
pub const EXIT_TIMED_OUT: i32 = 124;

pub const TIMEOUT_MARKER: &str = "[sandbox] command timed out";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOptions {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_millis: Option<u64>,
    #[serde(default)]
    pub image: Option<String>,
}

impl ExecOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_millis(mut self, millis: u64) -> Self {
        self.timeout_millis = Some(millis);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EXEC_TIMEOUT)
    }
}

/// Which provider produced a result, attached by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub provider_type: ProviderType,
    pub isolation_level: IsolationLevel,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_millis: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_info: Option<ProviderInfo>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// A result for a command that never started.
    pub fn spawn_failure(message: impl fmt::Display, duration: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("failed to spawn: {message}"),
            exit_code: EXIT_SPAWN_FAILED,
            duration_millis: duration.as_millis() as u64,
            timed_out: false,
            provider_info: None,
        }
    }
}

// ── Volumes / scripts ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOptions {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_millis: Option<u64>,
    /// Packages installed before the script runs.
    #[serde(default)]
    pub packages: Vec<String>,
}

// ── Tests ───────────────────────────────────────────────────────────
