use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::process_supervisor::{
    CommandSpec, DEFAULT_ENV_ALLOWLIST, DEFAULT_MAX_OUTPUT_BYTES, ProcessSupervisor, with_cwd,
};
use crate::sandbox::plugin::Plugin;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::script::{self, ScriptRuntime};
use crate::sandbox::types::*;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NativeConfig {
    /// Host variables passed through to children.
    pub env_allowlist: Option<Vec<String>>,
    pub max_output_bytes: Option<usize>,
    /// Working directory when a request names none.
    pub work_dir: Option<PathBuf>,
}

impl NativeConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, SandboxError> {
        serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| SandboxError::Configuration(format!("native: {e}")))
    }

    fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(
            self.env_allowlist
                .clone()
                .unwrap_or_else(|| DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect()),
            self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
        )
    }
}

/// Runs commands as plain host processes with a filtered environment.
///
/// Process-level isolation only: the child sees the host filesystem and
/// runs as the current user. Always available, so it is the fallback of
/// last resort.
pub struct NativeProvider {
    state: RwLock<NativeState>,
    stopped: AtomicBool,
}

struct NativeState {
    supervisor: ProcessSupervisor,
    work_dir: Option<PathBuf>,
}

impl Default for NativeProvider {
    fn default() -> Self {
        Self::new(NativeConfig::default())
    }
}

impl NativeProvider {
    pub fn new(config: NativeConfig) -> Self {
        Self {
            state: RwLock::new(NativeState {
                supervisor: config.supervisor(),
                work_dir: config.work_dir,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> (ProcessSupervisor, Option<PathBuf>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.supervisor.clone(), state.work_dir.clone())
    }
}

pub fn metadata() -> ProviderMetadata {
    ProviderMetadata {
        provider_type: ProviderType::NATIVE,
        name: "Native process".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        description: "Runs commands as host processes with a filtered environment".into(),
        config_schema: Some(json!({
            "type": "object",
            "properties": {
                "envAllowlist": {"type": "array"},
                "maxOutputBytes": {"type": "integer"},
                "workDir": {"type": "string"}
            },
            "additionalProperties": false
        })),
        capabilities: capabilities(),
        tags: vec!["builtin".into(), "fallback".into()],
        builtin: true,
        requires_verification: false,
    }
}

fn capabilities() -> Capabilities {
    let mut caps = Capabilities::new(IsolationLevel::Process).with_runtimes(["python", "node", "bash"]);
    caps.supports_networking = true;
    caps
}

pub fn plugin() -> Plugin {
    Plugin::new(metadata(), |config| {
        let config = NativeConfig::from_provider_config(&config)?;
        Ok(Arc::new(NativeProvider::new(config)))
    })
}

#[async_trait]
impl SandboxProvider for NativeProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::NATIVE
    }

    fn capabilities(&self) -> Capabilities {
        capabilities()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn init(&self, config: Option<ProviderConfig>) -> Result<(), SandboxError> {
        if let Some(config) = config {
            let config = NativeConfig::from_provider_config(&config)?;
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.supervisor = config.supervisor();
            state.work_dir = config.work_dir;
        }
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError> {
        let (supervisor, work_dir) = self.snapshot();
        tracing::debug!(command = %options.command, args = ?options.args, "native exec");
        let timeout = options.timeout();
        let mut spec = CommandSpec::new(options.command).args(options.args);
        spec.env = options.env;
        let spec = with_cwd(spec, options.cwd.as_deref(), work_dir.as_deref());
        supervisor.run(&spec, timeout).await
    }

    async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        let runtime = ScriptRuntime::detect(file_path)?;
        let mut base = ExecOptions::new(runtime.interpreter()).cwd(work_dir);
        base.env = options.env;
        base.timeout_millis = options.timeout_millis;

        if let Some(failed) = script::install_packages(self, runtime, &options.packages, &base).await? {
            return Ok(failed);
        }

        let mut run = runtime.command(&file_path.to_string_lossy(), &options.args);
        run.cwd = base.cwd;
        run.env = base.env;
        run.timeout_millis = base.timeout_millis;
        // Shares the host filesystem, so outputs are already in work_dir.
        self.exec(run).await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("native provider stopped");
        }
        Ok(())
    }
}
