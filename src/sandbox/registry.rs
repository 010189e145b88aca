//! Registry of sandbox plugins and their process-wide singleton instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;

use super::error::SandboxError;
use super::plugin::{Plugin, ProviderFactory};
use super::provider::SandboxProvider;
use super::types::{ProviderConfig, ProviderMetadata, ProviderType};
use super::verify::VerificationCache;

/// Holds plugin definitions, creates instances and aggregates availability.
///
/// Plugins keep their registration order, which breaks ties when the
/// selector orders candidates of equal isolation strength.
pub struct ProviderRegistry {
    plugins: RwLock<Vec<Arc<Plugin>>>,
    /// Default config per type, used by `get_instance`.
    configs: RwLock<HashMap<ProviderType, ProviderConfig>>,
    /// Singleton instances for non-pooled "default" access.
    instances: Mutex<HashMap<ProviderType, Arc<dyn SandboxProvider>>>,
    verification: Arc<VerificationCache>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(Arc::new(VerificationCache::new()))
    }
}

impl ProviderRegistry {
    pub fn new(verification: Arc<VerificationCache>) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            configs: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            verification,
        }
    }

    pub fn verification(&self) -> &Arc<VerificationCache> {
        &self.verification
    }

    /// Register a plugin. A plugin with an already registered type replaces
    /// the previous one in place; its cached singleton is dropped and
    /// stopped in the background.
    pub fn register(&self, plugin: Plugin) -> Result<(), SandboxError> {
        plugin.validate()?;
        let provider_type = plugin.provider_type().clone();
        let plugin = Arc::new(plugin);

        let replaced = {
            let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
            match plugins.iter_mut().find(|p| p.provider_type() == &provider_type) {
                Some(slot) => {
                    *slot = plugin;
                    true
                }
                None => {
                    plugins.push(plugin);
                    false
                }
            }
        };

        if replaced {
            tracing::info!(provider = %provider_type, "plugin overridden by new registration");
            self.verification.invalidate(&provider_type);
            self.evict_instance(&provider_type);
        } else {
            tracing::debug!(provider = %provider_type, "plugin registered");
        }
        Ok(())
    }

    fn evict_instance(&self, provider_type: &ProviderType) {
        let stale = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_type);
        let Some(stale) = stale else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = stale.stop().await {
                        tracing::warn!(error = %e, "failed to stop replaced provider instance");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(provider = %provider_type, "no runtime to stop replaced provider instance");
            }
        }
    }

    fn plugin(&self, provider_type: &ProviderType) -> Option<Arc<Plugin>> {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        plugins
            .iter()
            .find(|p| p.provider_type() == provider_type)
            .cloned()
    }

    fn plugin_or_err(&self, provider_type: &ProviderType) -> Result<Arc<Plugin>, SandboxError> {
        self.plugin(provider_type)
            .ok_or_else(|| SandboxError::UnknownProvider(provider_type.clone()))
    }

    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_registered(&self, provider_type: &ProviderType) -> bool {
        self.plugin(provider_type).is_some()
    }

    pub fn get(&self, provider_type: &ProviderType) -> Option<ProviderFactory> {
        self.plugin(provider_type).map(|p| p.factory.clone())
    }

    pub fn get_metadata(&self, provider_type: &ProviderType) -> Option<ProviderMetadata> {
        self.plugin(provider_type).map(|p| p.metadata.clone())
    }

    pub fn get_all_metadata(&self) -> Vec<ProviderMetadata> {
        self.plugins().iter().map(|p| p.metadata.clone()).collect()
    }

    /// Validate `config` against the plugin's schema without creating
    /// anything.
    pub fn validate_config(
        &self,
        provider_type: &ProviderType,
        config: &ProviderConfig,
    ) -> Result<(), SandboxError> {
        self.plugin_or_err(provider_type)?.validate_config(config)
    }

    /// Set the default config used by `get_instance` for this type. A cached
    /// singleton built with a different config is evicted.
    pub fn configure(
        &self,
        provider_type: &ProviderType,
        config: ProviderConfig,
    ) -> Result<(), SandboxError> {
        self.validate_config(provider_type, &config)?;
        let changed = {
            let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
            configs.insert(provider_type.clone(), config.clone()) != Some(config)
        };
        if changed {
            // A new config (image, binary) can change the verdict.
            self.verification.invalidate(provider_type);
            self.evict_instance(provider_type);
        }
        Ok(())
    }

    pub fn config_for(&self, provider_type: &ProviderType) -> ProviderConfig {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Construct a fresh, uninitialized instance.
    pub fn create(
        &self,
        provider_type: &ProviderType,
        config: ProviderConfig,
    ) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        let plugin = self.plugin_or_err(provider_type)?;
        plugin.instantiate(config)
    }

    /// Construct-or-reuse the singleton for this type, built with the
    /// configured default config.
    pub async fn get_instance(
        &self,
        provider_type: &ProviderType,
    ) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instances.get(provider_type) {
            return Ok(existing.clone());
        }
        let instance = self.create(provider_type, self.config_for(provider_type))?;
        instances.insert(provider_type.clone(), instance.clone());
        Ok(instance)
    }

    /// Availability of one instance, including the memoized verification
    /// probe when the plugin asks for it.
    pub async fn check_instance(
        &self,
        metadata: &ProviderMetadata,
        instance: &Arc<dyn SandboxProvider>,
    ) -> bool {
        if !instance.is_available().await {
            return false;
        }
        if !metadata.requires_verification {
            return true;
        }
        self.verification
            .verify(&metadata.provider_type, instance.verify())
            .await
    }

    /// Whether this type can run here. A failing or panicking check counts
    /// as unavailable.
    pub async fn is_available(self: &Arc<Self>, provider_type: &ProviderType) -> bool {
        let Some(metadata) = self.get_metadata(provider_type) else {
            return false;
        };
        let instance = match self.get_instance(provider_type).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(provider = %provider_type, error = %e, "could not create provider for availability check");
                return false;
            }
        };
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move { registry.check_instance(&metadata, &instance).await });
        match task.await {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(provider = %provider_type, error = %e, "availability check failed");
                false
            }
        }
    }

    /// Types whose availability check resolves true, in registration order.
    /// Checks run concurrently.
    pub async fn get_available(self: &Arc<Self>) -> Vec<ProviderType> {
        let types: Vec<ProviderType> = self
            .plugins()
            .iter()
            .map(|p| p.provider_type().clone())
            .collect();
        let checks = types.iter().map(|t| self.is_available(t));
        let results = join_all(checks).await;
        types
            .into_iter()
            .zip(results)
            .filter_map(|(t, ok)| ok.then_some(t))
            .collect()
    }

    /// Run every plugin's `on_init` hook.
    pub async fn activate(&self) -> Result<(), SandboxError> {
        for plugin in self.plugins() {
            if let Some(hook) = &plugin.on_init {
                hook().await.map_err(|e| {
                    SandboxError::Configuration(format!(
                        "{} on_init failed: {e}",
                        plugin.provider_type()
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Run every plugin's `on_destroy` hook. Best-effort.
    pub async fn deactivate(&self) -> Vec<(ProviderType, SandboxError)> {
        let mut failures = Vec::new();
        for plugin in self.plugins() {
            if let Some(hook) = &plugin.on_destroy {
                if let Err(e) = hook().await {
                    tracing::warn!(provider = %plugin.provider_type(), error = %e, "on_destroy hook failed");
                    failures.push((plugin.provider_type().clone(), e));
                }
            }
        }
        failures
    }

    /// Stop and forget every cached singleton. Individual failures are
    /// logged and returned, never propagated.
    pub async fn stop_all(&self) -> Vec<(ProviderType, SandboxError)> {
        let drained: Vec<(ProviderType, Arc<dyn SandboxProvider>)> = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let results = join_all(drained.into_iter().map(|(t, instance)| async move {
            (t, instance.stop().await)
        }))
        .await;

        let mut failures = Vec::new();
        for (provider_type, res) in results {
            if let Err(e) = res {
                tracing::warn!(provider = %provider_type, error = %e, "failed to stop provider");
                failures.push((provider_type, e));
            }
        }
        failures
    }

    /// Stop singletons and forget per-type configs. Plugins stay registered.
    pub async fn reset(&self) {
        self.stop_all().await;
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sandbox::testing::{FakeCounters, FakeProvider, fake_metadata};
    use crate::sandbox::types::IsolationLevel;

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::default())
    }

    #[tokio::test]
    async fn get_available_returns_exact_subset_regardless_of_order() {
        let orders: [&[(&str, bool)]; 2] = [
            &[("a", true), ("b", false), ("c", true)],
            &[("c", true), ("b", false), ("a", true)],
        ];
        for order in orders {
            let reg = registry();
            for (name, available) in order {
                let mut builder = FakeProvider::builder(name);
                if !available {
                    builder = builder.unavailable();
                }
                reg.register(builder.plugin()).unwrap();
            }
            let mut available: Vec<String> = reg
                .get_available()
                .await
                .into_iter()
                .map(|t| t.to_string())
                .collect();
            available.sort();
            assert_eq!(available, vec!["a", "c"]);
        }
    }

    #[tokio::test]
    async fn panicking_check_counts_as_unavailable() {
        let reg = registry();
        reg.register(FakeProvider::builder("ok").plugin()).unwrap();
        reg.register(FakeProvider::builder("boom").panic_on_available().plugin())
            .unwrap();
        assert_eq!(reg.get_available().await, vec![ProviderType::from("ok")]);
    }

    #[tokio::test]
    async fn re_registration_replaces_factory() {
        let reg = registry();
        reg.register(FakeProvider::builder("dup").stdout("first").plugin())
            .unwrap();
        reg.register(FakeProvider::builder("dup").stdout("second").plugin())
            .unwrap();

        assert_eq!(reg.plugins().len(), 1);
        let instance = reg.create(&"dup".into(), ProviderConfig::new()).unwrap();
        let out = instance
            .exec(crate::sandbox::types::ExecOptions::new("x"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "second");
    }

    #[tokio::test]
    async fn re_registration_evicts_old_singleton() {
        let reg = registry();
        let old = FakeCounters::default();
        reg.register(FakeProvider::builder("dup").counters(&old).plugin())
            .unwrap();
        let first = reg.get_instance(&"dup".into()).await.unwrap();

        reg.register(FakeProvider::builder("dup").plugin()).unwrap();
        let second = reg.get_instance(&"dup".into()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(old.stop.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_rejects_invalid_plugin() {
        let reg = ProviderRegistry::default();
        let mut meta = fake_metadata("bad", IsolationLevel::None);
        meta.name = "".into();
        let plugin = Plugin::new(meta, |_| Ok(FakeProvider::builder("bad").build_arc()));
        assert!(matches!(
            reg.register(plugin),
            Err(SandboxError::Configuration(_))
        ));
        assert!(!reg.is_registered(&"bad".into()));
    }

    #[test]
    fn create_unknown_type_fails() {
        let reg = ProviderRegistry::default();
        assert!(reg.get(&"nope".into()).is_none());
        assert!(matches!(
            reg.create(&"nope".into(), ProviderConfig::new()),
            Err(SandboxError::UnknownProvider(t)) if t.as_str() == "nope"
        ));
    }

    #[tokio::test]
    async fn get_instance_reuses_singleton() {
        let reg = registry();
        let counters = FakeCounters::default();
        reg.register(FakeProvider::builder("one").counters(&counters).plugin())
            .unwrap();
        let a = reg.get_instance(&"one".into()).await.unwrap();
        let b = reg.get_instance(&"one".into()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configure_validates_and_evicts() {
        let reg = registry();
        let mut plugin = FakeProvider::builder("cfg").plugin();
        plugin.metadata.config_schema =
            Some(serde_json::json!({"properties": {"image": {"type": "string"}}}));
        reg.register(plugin).unwrap();

        let bad = serde_json::json!({"image": 3}).as_object().cloned().unwrap();
        assert!(reg.configure(&"cfg".into(), bad).is_err());

        let first = reg.get_instance(&"cfg".into()).await.unwrap();
        let good = serde_json::json!({"image": "alpine"}).as_object().cloned().unwrap();
        reg.configure(&"cfg".into(), good.clone()).unwrap();
        assert_eq!(reg.config_for(&"cfg".into()), good);
        let second = reg.get_instance(&"cfg".into()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn verification_runs_once_per_type() {
        let reg = registry();
        let counters = FakeCounters::default();
        reg.register(
            FakeProvider::builder("vm")
                .isolation(IsolationLevel::Vm)
                .verify_fails()
                .counters(&counters)
                .verified_plugin(),
        )
        .unwrap();

        assert!(!reg.is_available(&"vm".into()).await);
        assert!(!reg.is_available(&"vm".into()).await);
        assert_eq!(counters.verified.load(Ordering::SeqCst), 1);
        assert_eq!(counters.available.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn config_change_reverifies() {
        let reg = registry();
        let counters = FakeCounters::default();
        reg.register(
            FakeProvider::builder("vm")
                .isolation(IsolationLevel::Vm)
                .verify_fails()
                .counters(&counters)
                .verified_plugin(),
        )
        .unwrap();
        let image = |name: &str| serde_json::json!({"image": name}).as_object().cloned().unwrap();

        assert!(!reg.is_available(&"vm".into()).await);
        reg.configure(&"vm".into(), image("a")).unwrap();
        assert!(!reg.is_available(&"vm".into()).await);
        assert_eq!(counters.verified.load(Ordering::SeqCst), 2);

        // Same config again keeps the cached verdict
        reg.configure(&"vm".into(), image("a")).unwrap();
        assert!(!reg.is_available(&"vm".into()).await);
        assert_eq!(counters.verified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_all_is_best_effort_and_clears_cache() {
        let reg = registry();
        let counters = FakeCounters::default();
        reg.register(FakeProvider::builder("a").counters(&counters).plugin())
            .unwrap();
        reg.register(FakeProvider::builder("b").counters(&counters).plugin())
            .unwrap();
        reg.get_instance(&"a".into()).await.unwrap();
        reg.get_instance(&"b".into()).await.unwrap();

        let failures = reg.stop_all().await;
        assert!(failures.is_empty());
        assert_eq!(counters.stop.load(Ordering::SeqCst), 2);

        // Second call has nothing left to stop
        reg.stop_all().await;
        assert_eq!(counters.stop.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn activate_and_deactivate_run_hooks() {
        let reg = registry();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let init_calls = calls.clone();
        let plugin = FakeProvider::builder("hooked")
            .plugin()
            .with_on_init(move || {
                let calls = init_calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .with_on_destroy(|| Box::pin(async { Err(SandboxError::Backend("teardown".into())) }));
        reg.register(plugin).unwrap();

        reg.activate().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failures = reg.deactivate().await;
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn metadata_introspection() {
        let reg = ProviderRegistry::default();
        reg.register(FakeProvider::builder("a").plugin()).unwrap();
        reg.register(FakeProvider::builder("b").isolation(IsolationLevel::Vm).plugin())
            .unwrap();
        let all = reg.get_all_metadata();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].provider_type.as_str(), "a");
        let b = reg.get_metadata(&"b".into()).unwrap();
        assert_eq!(b.capabilities.isolation_level, IsolationLevel::Vm);
    }
}
