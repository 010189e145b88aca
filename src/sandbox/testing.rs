//! Test doubles shared by the sandbox module tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::plugin::Plugin;
use super::provider::SandboxProvider;
use super::types::*;

pub fn fake_metadata(provider_type: &str, isolation: IsolationLevel) -> ProviderMetadata {
    ProviderMetadata {
        provider_type: ProviderType::from(provider_type),
        name: format!("Fake {provider_type}"),
        version: "0.0.1".into(),
        description: "test double".into(),
        config_schema: None,
        capabilities: Capabilities::new(isolation),
        tags: vec!["test".into()],
        builtin: false,
        requires_verification: false,
    }
}

/// Shared call counters, observable after the provider moved into a plugin.
#[derive(Debug, Clone, Default)]
pub struct FakeCounters {
    pub created: Arc<AtomicUsize>,
    pub available: Arc<AtomicUsize>,
    pub verified: Arc<AtomicUsize>,
    pub init: Arc<AtomicUsize>,
    pub stop: Arc<AtomicUsize>,
    pub exec: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct FakeProviderBuilder {
    provider_type: ProviderType,
    capabilities: Capabilities,
    available: bool,
    panic_on_available: bool,
    verify_ok: bool,
    init_error: Option<String>,
    stdout: String,
    create_delay: Option<Duration>,
    counters: FakeCounters,
    health: Option<Arc<AtomicBool>>,
}

impl FakeProviderBuilder {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.capabilities.isolation_level = level;
        self
    }

    pub fn pooling(mut self) -> Self {
        self.capabilities.supports_pooling = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn panic_on_available(mut self) -> Self {
        self.panic_on_available = true;
        self
    }

    pub fn verify_fails(mut self) -> Self {
        self.verify_ok = false;
        self
    }

    pub fn init_error(mut self, msg: &str) -> Self {
        self.init_error = Some(msg.into());
        self
    }

    pub fn stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn counters(mut self, counters: &FakeCounters) -> Self {
        self.counters = counters.clone();
        self
    }

    /// Availability follows `flag` after init, so tests can break a live
    /// instance.
    pub fn health(mut self, flag: &Arc<AtomicBool>) -> Self {
        self.health = Some(flag.clone());
        self
    }

    pub fn build(self) -> FakeProvider {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        FakeProvider {
            config: self,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn build_arc(self) -> Arc<dyn SandboxProvider> {
        Arc::new(self.build())
    }

    pub fn metadata(&self) -> ProviderMetadata {
        let mut meta = fake_metadata(self.provider_type.as_str(), self.capabilities.isolation_level);
        meta.capabilities = self.capabilities.clone();
        meta
    }

    /// Wrap this builder in a plugin whose factory builds a new instance
    /// per call.
    pub fn plugin(self) -> Plugin {
        let meta = self.metadata();
        Plugin::new(meta, move |_| Ok(self.clone().build_arc()))
    }

    pub fn verified_plugin(self) -> Plugin {
        let mut plugin = self.plugin();
        plugin.metadata.requires_verification = true;
        plugin
    }
}

/// In-memory provider whose behavior is scripted by its builder.
#[derive(Debug)]
pub struct FakeProvider {
    config: FakeProviderBuilder,
    stopped: AtomicBool,
}

impl FakeProvider {
    pub fn builder(provider_type: &str) -> FakeProviderBuilder {
        FakeProviderBuilder {
            provider_type: ProviderType::from(provider_type),
            capabilities: Capabilities::new(IsolationLevel::Process),
            available: true,
            panic_on_available: false,
            verify_ok: true,
            init_error: None,
            stdout: String::new(),
            create_delay: None,
            counters: FakeCounters::default(),
            health: None,
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn provider_type(&self) -> ProviderType {
        self.config.provider_type.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.config.capabilities.clone()
    }

    async fn is_available(&self) -> bool {
        self.config.counters.available.fetch_add(1, Ordering::SeqCst);
        if self.config.panic_on_available {
            panic!("availability probe blew up");
        }
        self.config.available
            && self
                .config
                .health
                .as_ref()
                .is_none_or(|h| h.load(Ordering::SeqCst))
    }

    async fn verify(&self) -> bool {
        self.config.counters.verified.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.config.verify_ok
    }

    async fn init(&self, _config: Option<ProviderConfig>) -> Result<(), SandboxError> {
        self.config.counters.init.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.config.create_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.config.available {
            return Err(SandboxError::unavailable(self.provider_type(), "fake unavailable"));
        }
        match &self.config.init_error {
            Some(msg) => Err(SandboxError::Backend(msg.clone())),
            None => Ok(()),
        }
    }

    async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError> {
        self.config.counters.exec.fetch_add(1, Ordering::SeqCst);
        let stdout = if self.config.stdout.is_empty() {
            format!("{} {}\n", options.command, options.args.join(" "))
        } else {
            self.config.stdout.clone()
        };
        Ok(ExecResult {
            stdout,
            exit_code: 0,
            ..ExecResult::default()
        })
    }

    async fn run_script(
        &self,
        file_path: &Path,
        _work_dir: &Path,
        _options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        self.exec(ExecOptions::new("script").arg(file_path.display().to_string()))
            .await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.config.counters.stop.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Shell stand-in for the docker CLI, written to `dir/docker`.
///
/// Containers are marker files next to the script and `exec` runs on the
/// host, so guest paths are host paths. Creating `dir/down` makes the
/// daemon unreachable; `restart` calls are appended to `dir/restarts`.
#[cfg(unix)]
pub fn fake_docker(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    const SCRIPT: &str = r#"#!/bin/sh
state="$(cd "$(dirname "$0")" && pwd)"
verb="$1"
shift
case "$verb" in
version)
    if [ -e "$state/down" ]; then
        echo "Cannot connect to the Docker daemon" >&2
        exit 1
    fi
    echo "27.0.0-fake"
    ;;
run)
    [ -e "$state/down" ] && exit 1
    name=""
    while [ $# -gt 0 ]; do
        case "$1" in
            --name) name="$2"; shift 2 ;;
            *) shift ;;
        esac
    done
    if [ -n "$name" ]; then
        touch "$state/container-$name"
    fi
    echo "$name"
    ;;
exec)
    dir=""
    while [ $# -gt 0 ]; do
        case "$1" in
            -w) dir="$2"; shift 2 ;;
            -e) export "$2"; shift 2 ;;
            *) break ;;
        esac
    done
    name="$1"
    shift
    if [ ! -e "$state/container-$name" ]; then
        echo "No such container: $name" >&2
        exit 1
    fi
    if [ -n "$dir" ]; then
        cd "$dir" || exit 126
    fi
    exec "$@"
    ;;
cp)
    cp "$1" "${2#*:}"
    ;;
inspect)
    if [ -e "$state/down" ] || [ ! -e "$state/container-$3" ]; then
        echo "Error: No such object: $3" >&2
        exit 1
    fi
    echo true
    ;;
restart)
    echo "$3" >> "$state/restarts"
    ;;
rm)
    rm -f "$state/container-$2"
    ;;
*)
    echo "unsupported: $verb" >&2
    exit 1
    ;;
esac
"#;

    let path = dir.join("docker");
    std::fs::write(&path, SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
