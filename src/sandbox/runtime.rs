//! `SandboxRuntime`: the owned component holding registry, pool and
//! verification cache, plus the selection and introspection APIs built on
//! top of them.
//!
//! Nothing here is global. Each runtime has its own caches, and `reset`
//! returns it to a freshly constructed state (plugins stay registered).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::backends;
use super::error::SandboxError;
use super::plugin::Plugin;
use super::pool::{PoolConfig, PoolStats, SandboxPool};
use super::registry::ProviderRegistry;
use super::selector::{ProviderSelector, SelectionPolicy, SelectionResult};
use super::types::{
    ExecOptions, ExecResult, ProviderConfig, ProviderMetadata, ProviderType, ScriptOptions,
};
use super::verify::VerificationCache;
use crate::config::SandboxSettings;

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub dev_mode: bool,
    pub pool: PoolConfig,
}

/// One row of the provider listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub metadata: ProviderMetadata,
    pub available: bool,
    pub is_current: bool,
}

#[derive(Debug, Default)]
struct ActiveProvider {
    /// Chosen explicitly via `switch_provider`/`sync_settings`.
    preferred: Option<ProviderType>,
    /// Last provider handed out, or the preferred one before any selection.
    current: Option<ProviderType>,
}

pub struct SandboxRuntime {
    registry: Arc<ProviderRegistry>,
    pool: Arc<SandboxPool>,
    verification: Arc<VerificationCache>,
    config: RuntimeConfig,
    active: RwLock<ActiveProvider>,
    activated: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let verification = Arc::new(VerificationCache::new());
        let registry = Arc::new(ProviderRegistry::new(verification.clone()));
        let pool = Arc::new(SandboxPool::new(registry.clone(), config.pool.clone()));
        Self {
            registry,
            pool,
            verification,
            config,
            active: RwLock::new(ActiveProvider::default()),
            activated: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// A runtime with the built-in `native` and `docker` plugins registered.
    pub fn with_builtins(config: RuntimeConfig) -> Result<Self, SandboxError> {
        let runtime = Self::new(config);
        for plugin in backends::builtin_plugins() {
            runtime.register_plugin(plugin)?;
        }
        Ok(runtime)
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    pub fn verification(&self) -> &Arc<VerificationCache> {
        &self.verification
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn register_plugin(&self, plugin: Plugin) -> Result<(), SandboxError> {
        self.registry.register(plugin)
    }

    /// Run plugin `on_init` hooks. Later calls are no-ops.
    pub async fn activate(&self) -> Result<(), SandboxError> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.registry.activate().await {
            self.activated.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Start the idle-eviction sweeper. Requires a tokio runtime.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(self.pool.start_sweeper());
        }
    }

    fn active(&self) -> std::sync::RwLockReadGuard<'_, ActiveProvider> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_mut(&self) -> std::sync::RwLockWriteGuard<'_, ActiveProvider> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_provider(&self) -> Option<ProviderType> {
        self.active().current.clone()
    }

    fn selector(&self) -> ProviderSelector {
        let policy = SelectionPolicy {
            dev_mode: self.config.dev_mode,
            preferred: self.active().preferred.clone(),
            ..SelectionPolicy::default()
        };
        ProviderSelector::new(self.registry.clone(), self.pool.clone(), policy)
    }

    // ── Selection API ───────────────────────────────────────────────

    /// Pick the strongest usable provider, degrading with a reported reason.
    /// Pooled selections must be released (or dropped) by the caller.
    pub async fn select_best_provider(&self) -> Result<SelectionResult, SandboxError> {
        let result = self.selector().select().await?;
        self.active_mut().current = Some(result.provider_type.clone());
        Ok(result)
    }

    pub async fn exec_via_best_provider(
        &self,
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        let selection = self.select_best_provider().await?;
        let info = selection.provider_info();
        let outcome = selection.provider.exec(options).await;
        selection.provider.release();
        let mut result = outcome?;
        result.provider_info = Some(info);
        Ok(result)
    }

    pub async fn run_script_via_best_provider(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        let selection = self.select_best_provider().await?;
        let info = selection.provider_info();
        let outcome = selection
            .provider
            .run_script(file_path, work_dir, options)
            .await;
        selection.provider.release();
        let mut result = outcome?;
        result.provider_info = Some(info);
        Ok(result)
    }

    // ── Introspection API ───────────────────────────────────────────

    async fn status_of(&self, metadata: ProviderMetadata, current: Option<&ProviderType>) -> ProviderStatus {
        let available = self.registry.is_available(&metadata.provider_type).await;
        let is_current = current == Some(&metadata.provider_type);
        ProviderStatus {
            metadata,
            available,
            is_current,
        }
    }

    /// Every registered provider with availability, in registration order.
    pub async fn list_providers(&self) -> Vec<ProviderStatus> {
        let current = self.current_provider();
        let all = self.registry.get_all_metadata();
        join_all(all.into_iter().map(|meta| self.status_of(meta, current.as_ref()))).await
    }

    pub async fn provider_detail(
        &self,
        provider_type: &ProviderType,
    ) -> Result<ProviderStatus, SandboxError> {
        let metadata = self
            .registry
            .get_metadata(provider_type)
            .ok_or_else(|| SandboxError::UnknownProvider(provider_type.clone()))?;
        let current = self.current_provider();
        Ok(self.status_of(metadata, current.as_ref()).await)
    }

    /// Make `provider_type` the active provider, optionally reconfiguring
    /// it. Fails if the type is unknown, the config is invalid, or the
    /// provider cannot run here.
    pub async fn switch_provider(
        &self,
        provider_type: &ProviderType,
        config: Option<ProviderConfig>,
    ) -> Result<ProviderStatus, SandboxError> {
        if !self.registry.is_registered(provider_type) {
            return Err(SandboxError::UnknownProvider(provider_type.clone()));
        }
        if let Some(config) = config {
            self.registry.configure(provider_type, config)?;
        }
        let status = self.provider_detail(provider_type).await?;
        if !status.available {
            return Err(SandboxError::unavailable(
                provider_type.clone(),
                "availability check failed",
            ));
        }
        {
            let mut active = self.active_mut();
            active.preferred = Some(provider_type.clone());
            active.current = Some(provider_type.clone());
        }
        tracing::info!(provider = %provider_type, "switched active sandbox provider");
        Ok(ProviderStatus {
            is_current: true,
            ..status
        })
    }

    /// Apply persisted settings. Disabled settings fall back to the native
    /// provider; an unavailable provider stays preferred and selection
    /// degrades from it as usual.
    pub async fn sync_settings(&self, settings: &SandboxSettings) -> Result<(), SandboxError> {
        let provider_type = if settings.enabled {
            settings.provider.clone()
        } else {
            ProviderType::NATIVE
        };
        if !self.registry.is_registered(&provider_type) {
            return Err(SandboxError::UnknownProvider(provider_type));
        }
        if settings.enabled {
            self.registry.configure(&provider_type, settings.config.clone())?;
        }
        if !self.registry.is_available(&provider_type).await {
            tracing::warn!(provider = %provider_type, "persisted sandbox provider is not available here");
        }
        let mut active = self.active_mut();
        active.preferred = Some(provider_type.clone());
        active.current = Some(provider_type.clone());
        tracing::info!(provider = %provider_type, enabled = settings.enabled, "synced sandbox settings");
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop singletons, drain the pool, forget verification results,
    /// configs and the active provider.
    pub async fn reset(&self) {
        self.registry.reset().await;
        self.pool.drain().await;
        self.verification.reset();
        *self.active_mut() = ActiveProvider::default();
        tracing::debug!("sandbox runtime reset");
    }

    /// Stop everything and run plugin `on_destroy` hooks.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        let drained = self.pool.close().await;
        let failed = self.registry.stop_all().await;
        let hook_failures = self.registry.deactivate().await;
        tracing::info!(
            pooled_stopped = drained,
            stop_failures = failed.len(),
            hook_failures = hook_failures.len(),
            "sandbox runtime shut down"
        );
    }
}
