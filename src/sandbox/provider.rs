use std::path::Path;

use async_trait::async_trait;

use super::error::SandboxError;
use super::types::{
    Capabilities, ExecOptions, ExecResult, ProviderConfig, ProviderType, ScriptOptions,
    VolumeMount,
};

/// A live sandbox backend bound to one `ProviderType`.
///
/// Instances are created by a plugin factory and owned by whichever component
/// created them (the registry singleton cache or a pool slot). Command
/// failures never surface as `Err`: a non-zero exit, crash or timeout comes
/// back as an `ExecResult`. `Err` is reserved for contract errors and for an
/// unusable backend.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Pure, synchronous, no side effects.
    fn capabilities(&self) -> Capabilities;

    /// Cheap presence check. Must be idempotent; memoize internally if it
    /// probes the host.
    async fn is_available(&self) -> bool;

    /// Expensive correctness probe (actually exercising the backend). Only
    /// called through the runtime's verification cache.
    async fn verify(&self) -> bool {
        self.is_available().await
    }

    /// Liveness of an initialized instance, asked by the pool for idle
    /// entries. Must not be memoized.
    async fn health_check(&self) -> bool {
        self.is_available().await
    }

    /// Prepare the instance. Fails with `Unavailable` on a host that cannot
    /// run this backend; calling twice with a compatible config is a no-op.
    async fn init(&self, config: Option<ProviderConfig>) -> Result<(), SandboxError>;

    /// Run one command to completion.
    async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError>;

    /// Run a script file, installing declared packages first and making the
    /// files it produces visible under `work_dir`.
    async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError>;

    /// Release the instance's resources. Safe to call repeatedly.
    async fn stop(&self) -> Result<(), SandboxError>;

    async fn shutdown(&self) -> Result<(), SandboxError> {
        self.stop().await
    }

    /// Host-to-sandbox mounts, applied on the next `init`. Ignored unless
    /// `capabilities().supports_volume_mounts`.
    fn set_volumes(&self, _mounts: Vec<VolumeMount>) {}
}

impl std::fmt::Debug for dyn SandboxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxProvider")
            .field("type", &self.provider_type())
            .finish_non_exhaustive()
    }
}
