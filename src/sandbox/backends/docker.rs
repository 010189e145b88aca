use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};

use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::process_supervisor::{
    CommandSpec, DEFAULT_ENV_ALLOWLIST, DEFAULT_MAX_OUTPUT_BYTES, ProcessSupervisor,
};
use crate::sandbox::plugin::Plugin;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::script::{self, ScriptRuntime};
use crate::sandbox::types::*;

const DOCKER_ENV: &[&str] = &["DOCKER_HOST", "DOCKER_CONFIG", "DOCKER_CONTEXT", "DOCKER_CERT_PATH"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(120);
const START_TIMEOUT: Duration = Duration::from_secs(120);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct DockerConfig {
    pub image: String,
    /// Attach the default bridge network. Off means `--network none`.
    pub network: bool,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    /// Guest directory for scripts and synced outputs.
    pub workdir: String,
    pub docker_bin: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "node:20-bookworm".into(),
            network: false,
            memory_mb: None,
            cpus: None,
            workdir: "/workspace".into(),
            docker_bin: "docker".into(),
        }
    }
}

impl DockerConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, SandboxError> {
        serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| SandboxError::Configuration(format!("docker: {e}")))
    }

    fn limit_args(&self, args: &mut Vec<String>) {
        if !self.network {
            args.extend(["--network".into(), "none".into()]);
        }
        if let Some(mb) = self.memory_mb {
            args.extend(["--memory".into(), format!("{mb}m")]);
        }
        if let Some(cpus) = self.cpus {
            args.extend(["--cpus".into(), cpus.to_string()]);
        }
    }
}

/// `docker run` arguments for the long-lived sandbox container.
pub fn run_args(config: &DockerConfig, name: &str, volumes: &[VolumeMount]) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), name.into()];
    config.limit_args(&mut args);
    args.extend(["-w".into(), config.workdir.clone()]);
    for v in volumes {
        let mut spec = format!("{}:{}", v.host_path.display(), v.guest_path);
        if v.read_only {
            spec.push_str(":ro");
        }
        args.extend(["-v".into(), spec]);
    }
    args.extend([config.image.clone(), "sleep".into(), "infinity".into()]);
    args
}

/// `docker exec` arguments for one command in a running container.
pub fn exec_args(container: &str, options: &ExecOptions) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into()];
    push_request_args(&mut args, options);
    args.push(container.into());
    args.push(options.command.clone());
    args.extend(options.args.iter().cloned());
    args
}

/// `docker run --rm` arguments for a command that wants a different image.
/// Named, so a timed-out run can be removed.
pub fn oneshot_args(
    config: &DockerConfig,
    name: &str,
    image: &str,
    options: &ExecOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--name".into(),
        name.into(),
    ];
    config.limit_args(&mut args);
    push_request_args(&mut args, options);
    args.push(image.into());
    args.push(options.command.clone());
    args.extend(options.args.iter().cloned());
    args
}

fn push_request_args(args: &mut Vec<String>, options: &ExecOptions) {
    if let Some(cwd) = &options.cwd {
        args.extend(["-w".into(), cwd.display().to_string()]);
    }
    for (k, v) in &options.env {
        args.extend(["-e".into(), format!("{k}={v}")]);
    }
}

/// Container isolation through the `docker` CLI.
///
/// `init` starts one long-lived container per instance; commands run in it
/// with `docker exec`. Instances are pool-managed, so concurrent callers
/// each hold their own container.
pub struct DockerProvider {
    config: RwLock<DockerConfig>,
    supervisor: ProcessSupervisor,
    available: OnceCell<bool>,
    /// Running container name. The lock also serializes init against stop.
    container: Mutex<Option<String>>,
    volumes: StdMutex<Vec<VolumeMount>>,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Self {
        let allowlist = DEFAULT_ENV_ALLOWLIST
            .iter()
            .chain(DOCKER_ENV)
            .map(|s| s.to_string())
            .collect();
        Self {
            config: RwLock::new(config),
            supervisor: ProcessSupervisor::new(allowlist, DEFAULT_MAX_OUTPUT_BYTES),
            available: OnceCell::new(),
            container: Mutex::new(None),
            volumes: StdMutex::new(Vec::new()),
        }
    }

    fn config(&self) -> DockerConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn docker(&self, args: Vec<String>, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let spec = CommandSpec::new(self.config().docker_bin).args(args);
        self.supervisor.run(&spec, timeout).await
    }

    /// Run a control command (`rm`, `restart`, ...) and fail on a non-zero exit.
    async fn control(&self, args: Vec<String>) -> Result<(), SandboxError> {
        let verb = args.first().cloned().unwrap_or_default();
        let res = self.docker(args, CONTROL_TIMEOUT).await?;
        if res.success() {
            Ok(())
        } else {
            Err(SandboxError::Backend(format!(
                "docker {verb} failed: {}",
                res.stderr.trim()
            )))
        }
    }

    /// Run `options` inside the container and fail on a non-zero exit.
    async fn guest(&self, options: ExecOptions) -> Result<(), SandboxError> {
        let command = options.command.clone();
        let res = self.exec(options).await?;
        if res.success() {
            Ok(())
        } else {
            Err(SandboxError::Exec(format!("{command} failed: {}", res.stderr.trim())))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_script_in(
        &self,
        container: &str,
        run_root: &str,
        file_path: &Path,
        file_name: &str,
        runtime: ScriptRuntime,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        let script_dir = format!("{run_root}/script");
        let out_dir = format!("{run_root}/out");
        let guest_script = format!("{script_dir}/{file_name}");

        self.guest(
            ExecOptions::new("mkdir")
                .args(["-p", script_dir.as_str(), out_dir.as_str()])
                .timeout_millis(CONTROL_TIMEOUT.as_millis() as u64),
        )
        .await?;
        self.control(vec![
            "cp".into(),
            file_path.display().to_string(),
            format!("{container}:{guest_script}"),
        ])
        .await?;

        let mut base = ExecOptions::new(runtime.interpreter()).cwd(&out_dir);
        base.env = options.env;
        base.timeout_millis = options.timeout_millis;

        if let Some(failed) = script::install_packages(self, runtime, &options.packages, &base).await? {
            return Ok(failed);
        }

        let mut run = runtime.command(&guest_script, &options.args);
        run.cwd = base.cwd;
        run.env = base.env;
        run.timeout_millis = base.timeout_millis;
        let result = self.exec(run).await?;

        match script::sync_back(self, &out_dir, work_dir).await {
            Ok(report) if !report.failed.is_empty() => {
                tracing::warn!(failed = report.failed.len(), "some sandbox files were not synced back");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "sync-back from docker sandbox failed"),
        }
        Ok(result)
    }

    async fn running_container(&self) -> Result<String, SandboxError> {
        self.container
            .lock()
            .await
            .clone()
            .ok_or_else(|| SandboxError::Exec("docker sandbox is not initialized".into()))
    }
}

pub fn metadata() -> ProviderMetadata {
    ProviderMetadata {
        provider_type: ProviderType::DOCKER,
        name: "Docker container".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        description: "Runs commands in a long-lived container via the docker CLI".into(),
        config_schema: Some(json!({
            "type": "object",
            "properties": {
                "image": {"type": "string"},
                "network": {"type": "boolean"},
                "memoryMb": {"type": "integer"},
                "cpus": {"type": "number"},
                "workdir": {"type": "string"},
                "dockerBin": {"type": "string"}
            },
            "additionalProperties": false
        })),
        capabilities: capabilities(),
        tags: vec!["builtin".into(), "container".into()],
        builtin: true,
        requires_verification: true,
    }
}

fn capabilities() -> Capabilities {
    let mut caps =
        Capabilities::new(IsolationLevel::Container).with_runtimes(["python", "node", "bash"]);
    caps.supports_volume_mounts = true;
    caps.supports_networking = true;
    caps.supports_pooling = true;
    caps
}

pub fn plugin() -> Plugin {
    Plugin::new(metadata(), |config| {
        let config = DockerConfig::from_provider_config(&config)?;
        Ok(Arc::new(DockerProvider::new(config)))
    })
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::DOCKER
    }

    fn capabilities(&self) -> Capabilities {
        capabilities()
    }

    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let args = vec!["version".into(), "--format".into(), "{{.Server.Version}}".into()];
                match self.docker(args, PROBE_TIMEOUT).await {
                    Ok(res) if res.success() => {
                        tracing::debug!(server = %res.stdout.trim(), "docker daemon reachable");
                        true
                    }
                    Ok(res) => {
                        tracing::debug!(stderr = %res.stderr.trim(), "docker not available");
                        false
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "docker probe failed");
                        false
                    }
                }
            })
            .await
    }

    async fn verify(&self) -> bool {
        if !self.is_available().await {
            return false;
        }
        let image = self.config().image;
        let args = vec!["run".into(), "--rm".into(), image.clone(), "true".into()];
        match self.docker(args, VERIFY_TIMEOUT).await {
            Ok(res) if res.success() => true,
            Ok(res) => {
                tracing::warn!(image = %image, stderr = %res.stderr.trim(), "docker verification run failed");
                false
            }
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "docker verification run failed");
                false
            }
        }
    }

    async fn init(&self, config: Option<ProviderConfig>) -> Result<(), SandboxError> {
        if let Some(config) = config {
            let parsed = DockerConfig::from_provider_config(&config)?;
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = parsed;
        }

        let mut container = self.container.lock().await;
        if container.is_some() {
            return Ok(());
        }
        if !self.is_available().await {
            return Err(SandboxError::unavailable(
                ProviderType::DOCKER,
                "docker daemon is not reachable",
            ));
        }

        let config = self.config();
        let name = format!("warden-{}", uuid::Uuid::new_v4().simple());
        let volumes = self.volumes.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let res = self.docker(run_args(&config, &name, &volumes), START_TIMEOUT).await?;
        if !res.success() {
            return Err(SandboxError::Backend(format!(
                "docker run {} failed: {}",
                config.image,
                res.stderr.trim()
            )));
        }
        tracing::info!(container = %name, image = %config.image, "docker sandbox started");
        *container = Some(name);
        Ok(())
    }

    async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError> {
        let config = self.config();
        let timeout = options.timeout();
        match options.image.as_deref() {
            Some(image) if image != config.image => {
                let name = format!("warden-run-{}", uuid::Uuid::new_v4().simple());
                tracing::debug!(image, command = %options.command, "docker one-shot exec");
                let result = self
                    .docker(oneshot_args(&config, &name, image, &options), timeout)
                    .await?;
                if result.timed_out {
                    // Killing the client leaves the container running.
                    if let Err(e) = self.control(vec!["rm".into(), "-f".into(), name.clone()]).await {
                        tracing::warn!(container = %name, error = %e, "failed to remove timed-out container");
                    }
                }
                Ok(result)
            }
            _ => {
                let container = self.running_container().await?;
                tracing::debug!(container = %container, command = %options.command, "docker exec");
                let result = self.docker(exec_args(&container, &options), timeout).await?;
                if result.timed_out {
                    // The in-container process outlives the killed client.
                    // Restarting kills every process in the container and
                    // keeps its filesystem.
                    tracing::warn!(container = %container, "docker exec timed out, restarting container");
                    if let Err(e) = self
                        .control(vec!["restart".into(), "-t".into(), "0".into(), container.clone()])
                        .await
                    {
                        tracing::warn!(container = %container, error = %e, "failed to restart container");
                    }
                }
                Ok(result)
            }
        }
    }

    async fn health_check(&self) -> bool {
        let Some(container) = self.container.lock().await.clone() else {
            return false;
        };
        let args = vec![
            "inspect".into(),
            "-f".into(),
            "{{.State.Running}}".into(),
            container.clone(),
        ];
        match self.docker(args, PROBE_TIMEOUT).await {
            Ok(res) => res.success() && res.stdout.trim() == "true",
            Err(e) => {
                tracing::debug!(container = %container, error = %e, "docker inspect failed");
                false
            }
        }
    }

    /// Each run gets its own guest directory: the script is copied into
    /// `script/`, runs with `out/` as its cwd, and only `out/` is synced
    /// back. The directory is removed afterwards, so a reused container
    /// never leaks one caller's files to the next.
    async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        let runtime = ScriptRuntime::detect(file_path)?;
        let container = self.running_container().await?;
        let config = self.config();

        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::Exec(format!("invalid script path {}", file_path.display())))?;
        let run_root = format!(
            "{}/.warden-{}",
            config.workdir.trim_end_matches('/'),
            uuid::Uuid::new_v4().simple()
        );

        let result = self
            .run_script_in(&container, &run_root, file_path, file_name, runtime, work_dir, options)
            .await;

        let cleanup = ExecOptions::new("rm")
            .args(["-rf", run_root.as_str()])
            .timeout_millis(CONTROL_TIMEOUT.as_millis() as u64);
        if let Err(e) = self.guest(cleanup).await {
            tracing::warn!(container = %container, dir = %run_root, error = %e, "failed to remove script run dir");
        }
        result
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let Some(name) = self.container.lock().await.take() else {
            return Ok(());
        };
        self.control(vec!["rm".into(), "-f".into(), name.clone()]).await?;
        tracing::info!(container = %name, "docker sandbox removed");
        Ok(())
    }

    fn set_volumes(&self, mounts: Vec<VolumeMount>) {
        *self.volumes.lock().unwrap_or_else(PoisonError::into_inner) = mounts;
    }
}
