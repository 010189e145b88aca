//! Shared pieces of `run_script`: interpreter detection, package
//! installation, and copying produced files back out of a sandbox that
//! does not share the host filesystem.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use super::error::SandboxError;
use super::local_host::FsJail;
use super::provider::SandboxProvider;
use super::types::{ExecOptions, ExecResult};

pub const INSTALL_FAILED_PREFIX: &str = "package installation failed";

/// Timeout for each `find`/`base64` round trip during sync-back.
const SYNC_STEP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    Python,
    Node,
    Bash,
}

impl ScriptRuntime {
    /// Pick the interpreter from the file extension.
    pub fn detect(path: &Path) -> Result<Self, SandboxError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("py") => Ok(ScriptRuntime::Python),
            Some("js" | "mjs" | "cjs") => Ok(ScriptRuntime::Node),
            Some("sh" | "bash") => Ok(ScriptRuntime::Bash),
            _ => Err(SandboxError::Exec(format!(
                "cannot determine script runtime for {}",
                path.display()
            ))),
        }
    }

    /// Name as listed in `Capabilities::supported_runtimes`.
    pub fn name(self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python",
            ScriptRuntime::Node => "node",
            ScriptRuntime::Bash => "bash",
        }
    }

    pub fn interpreter(self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python3",
            ScriptRuntime::Node => "node",
            ScriptRuntime::Bash => "bash",
        }
    }

    /// Installer invocation for `packages`, or `None` when there is nothing
    /// to install or the runtime has no package manager.
    pub fn install_command(self, packages: &[String]) -> Option<ExecOptions> {
        if packages.is_empty() {
            return None;
        }
        match self {
            ScriptRuntime::Python => Some(
                ExecOptions::new("python3")
                    .args(["-m", "pip", "install", "--quiet"])
                    .args(packages.iter().cloned()),
            ),
            ScriptRuntime::Node => Some(
                ExecOptions::new("npm")
                    .args(["install", "--no-save"])
                    .args(packages.iter().cloned()),
            ),
            ScriptRuntime::Bash => None,
        }
    }

    /// The command that runs `script` with `args`.
    pub fn command(self, script: &str, args: &[String]) -> ExecOptions {
        ExecOptions::new(self.interpreter())
            .arg(script)
            .args(args.iter().cloned())
    }
}

/// Run the installer through `provider`. Returns `Some(result)` when
/// installation failed and the script must not run.
pub async fn install_packages(
    provider: &dyn SandboxProvider,
    runtime: ScriptRuntime,
    packages: &[String],
    base: &ExecOptions,
) -> Result<Option<ExecResult>, SandboxError> {
    let Some(mut install) = runtime.install_command(packages) else {
        return Ok(None);
    };
    install.cwd = base.cwd.clone();
    install.env = base.env.clone();
    install.timeout_millis = base.timeout_millis;
    install.image = base.image.clone();

    tracing::info!(
        provider = %provider.provider_type(),
        runtime = runtime.name(),
        count = packages.len(),
        "installing script packages"
    );
    let result = provider.exec(install).await?;
    if result.success() {
        return Ok(None);
    }
    Ok(Some(install_failed(result)))
}

/// Prefix the installer's stderr so callers can tell it apart from a
/// script failure.
pub fn install_failed(mut result: ExecResult) -> ExecResult {
    result.stderr = if result.stderr.is_empty() {
        INSTALL_FAILED_PREFIX.to_string()
    } else {
        format!("{INSTALL_FAILED_PREFIX}: {}", result.stderr)
    };
    result
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub copied: Vec<PathBuf>,
    /// Guest path and the reason it was skipped.
    pub failed: Vec<(String, String)>,
}

/// Copy every regular file under `guest_root` into `host_dir`, preserving
/// relative paths.
///
/// Lists with `find`, then reads each file with `base64`: one round trip per
/// file, no streaming. Best-effort: per-file failures land in the report.
pub async fn sync_back(
    provider: &dyn SandboxProvider,
    guest_root: &str,
    host_dir: &Path,
) -> Result<SyncReport, SandboxError> {
    let root = guest_root.trim_end_matches('/');
    let listing = provider
        .exec(
            ExecOptions::new("find")
                .args([if root.is_empty() { "/" } else { root }, "-type", "f"])
                .timeout_millis(SYNC_STEP_TIMEOUT_MS),
        )
        .await?;
    if !listing.success() {
        return Err(SandboxError::Exec(format!(
            "listing {guest_root} failed: {}",
            listing.stderr.trim()
        )));
    }

    let jail = FsJail::create(host_dir.to_path_buf())?;
    let mut report = SyncReport::default();

    for guest_path in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(relative) = guest_path
            .strip_prefix(root)
            .map(|r| r.trim_start_matches('/'))
            .filter(|r| !r.is_empty())
        else {
            report
                .failed
                .push((guest_path.to_string(), "outside sync root".into()));
            continue;
        };

        match copy_one(provider, guest_path, relative, &jail).await {
            Ok(host_path) => report.copied.push(host_path),
            Err(e) => {
                tracing::debug!(path = guest_path, error = %e, "sync-back skipped file");
                report.failed.push((guest_path.to_string(), e.to_string()));
            }
        }
    }

    tracing::info!(
        provider = %provider.provider_type(),
        copied = report.copied.len(),
        failed = report.failed.len(),
        "synced sandbox files back to host"
    );
    Ok(report)
}

async fn copy_one(
    provider: &dyn SandboxProvider,
    guest_path: &str,
    relative: &str,
    jail: &FsJail,
) -> Result<PathBuf, SandboxError> {
    let read = provider
        .exec(
            ExecOptions::new("base64")
                .arg(guest_path)
                .timeout_millis(SYNC_STEP_TIMEOUT_MS),
        )
        .await?;
    if !read.success() {
        return Err(SandboxError::Exec(format!("read failed: {}", read.stderr.trim())));
    }
    let encoded: String = read.stdout.split_whitespace().collect();
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| SandboxError::Serde(format!("invalid base64 for {guest_path}: {e}")))?;
    jail.put_file(relative, &bytes)
}
