//! Best-provider-with-fallback selection.
//!
//! Normal mode walks registered providers strongest isolation first and
//! returns the first one that is available and initializes. Development mode
//! skips straight to the fallback provider. Either way a degraded choice is
//! reported through `used_fallback` and `fallback_reason`, never as an error.

use std::path::Path;
use std::sync::Arc;

use super::error::{CandidateFailure, SandboxError};
use super::pool::{PooledSandbox, SandboxPool};
use super::provider::SandboxProvider;
use super::registry::ProviderRegistry;
use super::types::{
    ExecOptions, ExecResult, IsolationLevel, ProviderInfo, ProviderMetadata, ProviderType,
    ScriptOptions,
};

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub dev_mode: bool,
    /// Tried first when registered, regardless of isolation strength.
    pub preferred: Option<ProviderType>,
    /// Weakest always-available provider, used directly in dev mode.
    pub fallback_type: ProviderType,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            dev_mode: false,
            preferred: None,
            fallback_type: ProviderType::NATIVE,
        }
    }
}

/// A ready-to-use provider. Pooled selections go back to the pool on
/// `release` (or drop); shared singletons stay alive in the registry.
#[derive(Debug)]
pub enum SelectedProvider {
    Shared(Arc<dyn SandboxProvider>),
    Pooled(PooledSandbox),
}

impl SelectedProvider {
    pub fn instance(&self) -> &Arc<dyn SandboxProvider> {
        match self {
            SelectedProvider::Shared(instance) => instance,
            SelectedProvider::Pooled(sandbox) => sandbox.instance(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, SelectedProvider::Pooled(_))
    }

    pub async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError> {
        self.instance().exec(options).await
    }

    pub async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        self.instance().run_script(file_path, work_dir, options).await
    }

    pub fn release(self) {
        if let SelectedProvider::Pooled(sandbox) = self {
            sandbox.release();
        }
    }
}

#[derive(Debug)]
pub struct SelectionResult {
    pub provider: SelectedProvider,
    pub provider_type: ProviderType,
    pub isolation_level: IsolationLevel,
    /// The chosen provider was not the first in priority order.
    pub used_fallback: bool,
    pub fallback_reason: Option<String>,
    /// Every candidate rejected before the chosen one.
    pub failures: Vec<CandidateFailure>,
}

impl SelectionResult {
    pub fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            provider_type: self.provider_type.clone(),
            isolation_level: self.isolation_level,
            used_fallback: self.used_fallback,
        }
    }
}

pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    pool: Arc<SandboxPool>,
    policy: SelectionPolicy,
}

impl ProviderSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pool: Arc<SandboxPool>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            registry,
            pool,
            policy,
        }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Registered providers in priority order: the preferred type first,
    /// then by descending isolation strength, ties by registration order.
    pub fn candidates(&self) -> Vec<ProviderMetadata> {
        let mut all = self.registry.get_all_metadata();
        // Stable sort keeps registration order among equals.
        all.sort_by_key(|m| std::cmp::Reverse(m.capabilities.isolation_level.strength()));
        if let Some(preferred) = &self.policy.preferred {
            if let Some(idx) = all.iter().position(|m| &m.provider_type == preferred) {
                let meta = all.remove(idx);
                all.insert(0, meta);
            }
        }
        all
    }

    pub async fn select(&self) -> Result<SelectionResult, SandboxError> {
        if self.policy.dev_mode {
            return self.select_fallback().await;
        }

        let candidates = self.candidates();
        let mut failures: Vec<CandidateFailure> = Vec::new();

        for (idx, meta) in candidates.iter().enumerate() {
            let provider_type = &meta.provider_type;
            match self.try_candidate(meta).await {
                Ok(provider) => {
                    let used_fallback = idx > 0;
                    let fallback_reason = used_fallback.then(|| {
                        failures
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; ")
                    });
                    if let Some(reason) = &fallback_reason {
                        tracing::warn!(
                            provider = %provider_type,
                            isolation = %meta.capabilities.isolation_level,
                            reason = %reason,
                            "selected fallback sandbox provider"
                        );
                    } else {
                        tracing::info!(provider = %provider_type, "selected sandbox provider");
                    }
                    return Ok(SelectionResult {
                        provider,
                        provider_type: provider_type.clone(),
                        isolation_level: meta.capabilities.isolation_level,
                        used_fallback,
                        fallback_reason,
                        failures,
                    });
                }
                Err(failure) => {
                    tracing::info!(provider = %provider_type, reason = %failure.reason, "skipping sandbox provider");
                    failures.push(failure);
                }
            }
        }

        tracing::error!(candidates = candidates.len(), "no sandbox provider available");
        Err(SandboxError::NoProviderAvailable { reasons: failures })
    }

    async fn select_fallback(&self) -> Result<SelectionResult, SandboxError> {
        let fallback = &self.policy.fallback_type;
        let Some(meta) = self.registry.get_metadata(fallback) else {
            return Err(SandboxError::NoProviderAvailable {
                reasons: vec![CandidateFailure::new(
                    fallback.clone(),
                    "development fallback provider is not registered",
                )],
            });
        };
        let provider = self
            .try_candidate(&meta)
            .await
            .map_err(|failure| SandboxError::NoProviderAvailable {
                reasons: vec![failure],
            })?;
        let reason = format!("development mode: strong isolation skipped, using {fallback}");
        tracing::info!(provider = %fallback, "{reason}");
        Ok(SelectionResult {
            provider,
            provider_type: fallback.clone(),
            isolation_level: meta.capabilities.isolation_level,
            used_fallback: true,
            fallback_reason: Some(reason),
            failures: Vec::new(),
        })
    }

    /// Availability (including cached verification), then a ready instance.
    /// Any failure becomes a reason to move on.
    async fn try_candidate(
        &self,
        meta: &ProviderMetadata,
    ) -> Result<SelectedProvider, CandidateFailure> {
        let provider_type = &meta.provider_type;
        if !self.registry.is_available(provider_type).await {
            let reason = if meta.requires_verification
                && self.registry.verification().cached(provider_type) == Some(false)
            {
                "runtime verification failed"
            } else {
                "not available on this host"
            };
            return Err(CandidateFailure::new(provider_type.clone(), reason));
        }

        let config = self.registry.config_for(provider_type);
        let prepared = if meta.capabilities.supports_pooling {
            self.pool
                .acquire(provider_type, config)
                .await
                .map(SelectedProvider::Pooled)
        } else {
            match self.registry.get_instance(provider_type).await {
                Ok(instance) => instance
                    .init(Some(config))
                    .await
                    .map(|()| SelectedProvider::Shared(instance)),
                Err(e) => Err(e),
            }
        };
        prepared.map_err(|e| CandidateFailure::new(provider_type.clone(), format!("init failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sandbox::pool::PoolConfig;
    use crate::sandbox::testing::{FakeCounters, FakeProvider};

    fn selector_with(plugins: Vec<crate::sandbox::plugin::Plugin>, policy: SelectionPolicy) -> ProviderSelector {
        let registry = Arc::new(ProviderRegistry::default());
        for plugin in plugins {
            registry.register(plugin).unwrap();
        }
        let pool = Arc::new(SandboxPool::new(registry.clone(), PoolConfig::default()));
        ProviderSelector::new(registry, pool, policy)
    }

    #[tokio::test]
    async fn unavailable_vm_falls_back_to_process() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("a")
                    .isolation(IsolationLevel::Vm)
                    .unavailable()
                    .plugin(),
                FakeProvider::builder("b").isolation(IsolationLevel::Process).plugin(),
            ],
            SelectionPolicy::default(),
        );
        for _ in 0..3 {
            let result = selector.select().await.unwrap();
            assert_eq!(result.provider_type.as_str(), "b");
            assert!(result.used_fallback);
            let reason = result.fallback_reason.unwrap();
            assert!(reason.contains("a: not available"), "{reason}");
        }
    }

    #[tokio::test]
    async fn strongest_available_wins_without_fallback() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("proc").isolation(IsolationLevel::Process).plugin(),
                FakeProvider::builder("vm").isolation(IsolationLevel::Vm).plugin(),
                FakeProvider::builder("box").isolation(IsolationLevel::Container).plugin(),
            ],
            SelectionPolicy::default(),
        );
        let order: Vec<_> = selector
            .candidates()
            .into_iter()
            .map(|m| m.provider_type.to_string())
            .collect();
        assert_eq!(order, vec!["vm", "box", "proc"]);

        let result = selector.select().await.unwrap();
        assert_eq!(result.provider_type.as_str(), "vm");
        assert!(!result.used_fallback);
        assert!(result.fallback_reason.is_none());
        assert_eq!(result.provider_info().isolation_level, IsolationLevel::Vm);
    }

    #[tokio::test]
    async fn equal_strength_keeps_registration_order() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("first").plugin(),
                FakeProvider::builder("second").plugin(),
            ],
            SelectionPolicy::default(),
        );
        let result = selector.select().await.unwrap();
        assert_eq!(result.provider_type.as_str(), "first");
    }

    #[tokio::test]
    async fn init_failure_moves_to_next_candidate() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("vm")
                    .isolation(IsolationLevel::Vm)
                    .init_error("kernel missing")
                    .plugin(),
                FakeProvider::builder("native").plugin(),
            ],
            SelectionPolicy::default(),
        );
        let result = selector.select().await.unwrap();
        assert_eq!(result.provider_type.as_str(), "native");
        assert!(result.fallback_reason.unwrap().contains("kernel missing"));
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_candidates_report_every_reason() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("vm")
                    .isolation(IsolationLevel::Vm)
                    .unavailable()
                    .plugin(),
                FakeProvider::builder("native").init_error("broken").plugin(),
            ],
            SelectionPolicy::default(),
        );
        match selector.select().await {
            Err(SandboxError::NoProviderAvailable { reasons }) => {
                assert_eq!(reasons.len(), 2);
                assert_eq!(reasons[0].provider_type.as_str(), "vm");
                assert_eq!(reasons[1].provider_type.as_str(), "native");
            }
            other => panic!("expected NoProviderAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_registry_is_an_error() {
        let selector = selector_with(vec![], SelectionPolicy::default());
        let err = selector.select().await.unwrap_err();
        assert!(err.to_string().contains("no candidates registered"));
    }

    #[tokio::test]
    async fn failed_verification_falls_back_to_native() {
        let boxlite = FakeCounters::default();
        let selector = selector_with(
            vec![
                FakeProvider::builder("native").plugin(),
                FakeProvider::builder("boxlite")
                    .isolation(IsolationLevel::Vm)
                    .verify_fails()
                    .counters(&boxlite)
                    .verified_plugin(),
            ],
            SelectionPolicy::default(),
        );
        for _ in 0..2 {
            let result = selector.select().await.unwrap();
            assert_eq!(result.provider_type, ProviderType::NATIVE);
            assert!(result.used_fallback);
            assert!(
                result
                    .fallback_reason
                    .unwrap()
                    .contains("runtime verification failed")
            );
        }
        assert_eq!(boxlite.verified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dev_mode_goes_straight_to_fallback() {
        let vm = FakeCounters::default();
        let selector = selector_with(
            vec![
                FakeProvider::builder("vm")
                    .isolation(IsolationLevel::Vm)
                    .counters(&vm)
                    .plugin(),
                FakeProvider::builder("native").plugin(),
            ],
            SelectionPolicy {
                dev_mode: true,
                ..SelectionPolicy::default()
            },
        );
        let result = selector.select().await.unwrap();
        assert_eq!(result.provider_type, ProviderType::NATIVE);
        assert!(result.used_fallback);
        assert!(result.fallback_reason.unwrap().contains("development mode"));
        assert_eq!(vm.available.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dev_mode_without_fallback_registered() {
        let selector = selector_with(
            vec![FakeProvider::builder("vm").isolation(IsolationLevel::Vm).plugin()],
            SelectionPolicy {
                dev_mode: true,
                ..SelectionPolicy::default()
            },
        );
        assert!(matches!(
            selector.select().await,
            Err(SandboxError::NoProviderAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn preferred_type_is_tried_first() {
        let selector = selector_with(
            vec![
                FakeProvider::builder("vm").isolation(IsolationLevel::Vm).plugin(),
                FakeProvider::builder("native").plugin(),
            ],
            SelectionPolicy {
                preferred: Some(ProviderType::NATIVE),
                ..SelectionPolicy::default()
            },
        );
        let result = selector.select().await.unwrap();
        assert_eq!(result.provider_type, ProviderType::NATIVE);
        assert!(!result.used_fallback);
    }

    #[tokio::test]
    async fn poolable_candidates_come_from_the_pool() {
        let counters = FakeCounters::default();
        let selector = selector_with(
            vec![
                FakeProvider::builder("docker")
                    .isolation(IsolationLevel::Container)
                    .pooling()
                    .counters(&counters)
                    .plugin(),
            ],
            SelectionPolicy::default(),
        );
        let first = selector.select().await.unwrap();
        assert!(first.provider.is_pooled());
        let instance = first.provider.instance().clone();
        first.provider.release();

        let second = selector.select().await.unwrap();
        assert!(Arc::ptr_eq(&instance, second.provider.instance()));
        let out = second
            .provider
            .exec(ExecOptions::new("echo").arg("pooled"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "echo pooled\n");
    }
}
