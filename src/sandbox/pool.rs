//! Bounded pool of reusable, expensive-to-create provider instances.
//!
//! Entries are keyed by provider type plus config fingerprint. The size check
//! and slot reservation happen under one lock, so concurrent `acquire` calls
//! can never both create the last allowed instance. Instance creation and
//! `init` run outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::SandboxError;
use super::provider::SandboxProvider;
use super::registry::ProviderRegistry;
use super::types::{
    Capabilities, ExecOptions, ExecResult, ProviderConfig, ProviderType, ScriptOptions,
    config_fingerprint,
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live entries per provider type.
    pub max_size: usize,
    /// Idle entries unused for this long are stopped by the sweeper.
    pub idle_ttl: Duration,
    /// How long `acquire` waits for a slot before `PoolExhausted`.
    pub acquire_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            idle_ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub by_type: BTreeMap<ProviderType, usize>,
}

struct PoolEntry {
    id: u64,
    provider_type: ProviderType,
    fingerprint: String,
    instance: Arc<dyn SandboxProvider>,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    /// Slots claimed by in-flight creations, per type.
    reserved: HashMap<ProviderType, usize>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn live_count(&self, provider_type: &ProviderType) -> usize {
        let existing = self
            .entries
            .iter()
            .filter(|e| &e.provider_type == provider_type)
            .count();
        existing + self.reserved.get(provider_type).copied().unwrap_or(0)
    }

    fn unreserve(&mut self, provider_type: &ProviderType) {
        if let Some(n) = self.reserved.get_mut(provider_type) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.reserved.remove(provider_type);
            }
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled whenever a slot or an idle entry may have become free.
    released: Notify,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark an entry idle again. Entries returned to a closed pool are
    /// removed and handed back so the caller can stop them.
    fn release(&self, id: u64) -> Option<Arc<dyn SandboxProvider>> {
        let orphan = {
            let mut state = self.lock();
            let closed = state.closed;
            match state.entries.iter().position(|e| e.id == id) {
                Some(idx) if closed => Some(state.entries.remove(idx).instance),
                Some(idx) => {
                    let entry = &mut state.entries[idx];
                    entry.in_use = false;
                    entry.last_used_at = Instant::now();
                    None
                }
                None => None,
            }
        };
        self.released.notify_waiters();
        orphan
    }
}

enum Claim {
    Idle(PooledSandbox),
    Create(Reservation, Option<Arc<dyn SandboxProvider>>),
    Full,
}

/// A claimed creation slot. Dropping it without `commit` gives the slot
/// back, which covers both creation failures and cancelled acquires.
struct Reservation {
    shared: Arc<PoolShared>,
    provider_type: ProviderType,
    armed: bool,
}

impl Reservation {
    fn commit(mut self, fingerprint: String, instance: Arc<dyn SandboxProvider>) -> PooledSandbox {
        let mut state = self.shared.lock();
        state.unreserve(&self.provider_type);
        let id = state.next_id;
        state.next_id += 1;
        let now = Instant::now();
        state.entries.push(PoolEntry {
            id,
            provider_type: self.provider_type.clone(),
            fingerprint: fingerprint.clone(),
            instance: instance.clone(),
            created_at: now,
            last_used_at: now,
            in_use: true,
        });
        drop(state);
        self.armed = false;
        PooledSandbox {
            id,
            provider_type: self.provider_type.clone(),
            fingerprint,
            instance,
            shared: self.shared.clone(),
            released: false,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().unreserve(&self.provider_type);
            self.shared.released.notify_waiters();
        }
    }
}

/// An instance checked out of the pool. Return it with `release`; dropping
/// it releases it as well. Stopping is the pool's job, so this handle
/// exposes no `stop`.
pub struct PooledSandbox {
    id: u64,
    provider_type: ProviderType,
    fingerprint: String,
    instance: Arc<dyn SandboxProvider>,
    shared: Arc<PoolShared>,
    released: bool,
}

impl std::fmt::Debug for PooledSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSandbox")
            .field("id", &self.id)
            .field("provider_type", &self.provider_type)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl PooledSandbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn provider_type(&self) -> &ProviderType {
        &self.provider_type
    }

    pub fn instance(&self) -> &Arc<dyn SandboxProvider> {
        &self.instance
    }

    pub fn capabilities(&self) -> Capabilities {
        self.instance.capabilities()
    }

    pub async fn exec(&self, options: ExecOptions) -> Result<ExecResult, SandboxError> {
        self.instance.exec(options).await
    }

    pub async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptOptions,
    ) -> Result<ExecResult, SandboxError> {
        self.instance.run_script(file_path, work_dir, options).await
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(orphan) = self.shared.release(self.id) {
            stop_in_background(orphan);
        }
    }
}

impl Drop for PooledSandbox {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn stop_in_background(instance: Arc<dyn SandboxProvider>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = instance.stop().await {
                tracing::warn!(provider = %instance.provider_type(), error = %e, "failed to stop pooled instance");
            }
        });
    }
}

pub struct SandboxPool {
    registry: Arc<ProviderRegistry>,
    config: PoolConfig,
    shared: Arc<PoolShared>,
}

impl SandboxPool {
    pub fn new(registry: Arc<ProviderRegistry>, config: PoolConfig) -> Self {
        Self {
            registry,
            config,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn try_claim(
        &self,
        provider_type: &ProviderType,
        fingerprint: &str,
    ) -> Result<Claim, SandboxError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(SandboxError::Configuration("sandbox pool is closed".into()));
        }

        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| !e.in_use && &e.provider_type == provider_type && e.fingerprint == fingerprint)
        {
            entry.in_use = true;
            entry.last_used_at = Instant::now();
            return Ok(Claim::Idle(PooledSandbox {
                id: entry.id,
                provider_type: provider_type.clone(),
                fingerprint: fingerprint.to_string(),
                instance: entry.instance.clone(),
                shared: self.shared.clone(),
                released: false,
            }));
        }

        let at_capacity = state.live_count(provider_type) >= self.config.max_size;
        let mut evicted = None;
        if at_capacity {
            // An idle entry with another config can make room.
            let Some(idx) = state
                .entries
                .iter()
                .position(|e| !e.in_use && &e.provider_type == provider_type)
            else {
                return Ok(Claim::Full);
            };
            evicted = Some(state.entries.remove(idx).instance);
        }

        *state.reserved.entry(provider_type.clone()).or_insert(0) += 1;
        Ok(Claim::Create(
            Reservation {
                shared: self.shared.clone(),
                provider_type: provider_type.clone(),
                armed: true,
            },
            evicted,
        ))
    }

    /// Check out an instance for `provider_type` + `config`: reuse an idle
    /// match, create one under capacity, or wait for a release until
    /// `acquire_timeout` elapses.
    pub async fn acquire(
        &self,
        provider_type: &ProviderType,
        config: ProviderConfig,
    ) -> Result<PooledSandbox, SandboxError> {
        let metadata = self
            .registry
            .get_metadata(provider_type)
            .ok_or_else(|| SandboxError::UnknownProvider(provider_type.clone()))?;
        if !metadata.capabilities.supports_pooling {
            return Err(SandboxError::Configuration(format!(
                "provider {provider_type} does not support pooling"
            )));
        }
        self.registry.validate_config(provider_type, &config)?;

        let fingerprint = config_fingerprint(&config);
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(provider_type, &fingerprint)? {
                Claim::Idle(sandbox) => {
                    tracing::debug!(provider = %provider_type, id = sandbox.id, "reusing pooled sandbox");
                    return Ok(sandbox);
                }
                Claim::Create(reservation, evicted) => {
                    if let Some(evicted) = evicted {
                        tracing::debug!(provider = %provider_type, "evicting idle entry with different config");
                        if let Err(e) = evicted.stop().await {
                            tracing::warn!(provider = %provider_type, error = %e, "failed to stop evicted instance");
                        }
                    }
                    return self
                        .create_entry(reservation, provider_type, fingerprint, config)
                        .await;
                }
                Claim::Full => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                tracing::warn!(
                    provider = %provider_type,
                    max_size = self.config.max_size,
                    "sandbox pool exhausted"
                );
                return Err(SandboxError::PoolExhausted {
                    provider: provider_type.clone(),
                    waited: self.config.acquire_timeout,
                });
            }
        }
    }

    async fn create_entry(
        &self,
        reservation: Reservation,
        provider_type: &ProviderType,
        fingerprint: String,
        config: ProviderConfig,
    ) -> Result<PooledSandbox, SandboxError> {
        let started = std::time::Instant::now();
        let instance = self.registry.create(provider_type, config.clone())?;
        if let Err(e) = instance.init(Some(config)).await {
            if let Err(stop_err) = instance.stop().await {
                tracing::debug!(provider = %provider_type, error = %stop_err, "stop after failed init");
            }
            return Err(e);
        }
        let sandbox = reservation.commit(fingerprint, instance);
        tracing::info!(
            provider = %provider_type,
            id = sandbox.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "created pooled sandbox"
        );
        Ok(sandbox)
    }

    /// Return an instance to the idle set. Does not stop it.
    pub fn release(&self, sandbox: PooledSandbox) {
        sandbox.release();
    }

    /// Stop idle entries unused for longer than `idle_ttl`. In-use entries
    /// are never evicted.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<PoolEntry> = {
            let mut state = self.shared.lock();
            let ttl = self.config.idle_ttl;
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| !e.in_use && e.last_used_at.elapsed() >= ttl);
            state.entries = kept;
            expired
        };
        let count = expired.len();
        for entry in expired {
            tracing::debug!(
                provider = %entry.provider_type,
                id = entry.id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "evicting idle pooled sandbox"
            );
            if let Err(e) = entry.instance.stop().await {
                tracing::warn!(provider = %entry.provider_type, error = %e, "failed to stop idle instance");
            }
        }
        if count > 0 {
            self.shared.released.notify_waiters();
        }
        count
    }

    /// Probe every idle entry with `health_check`; failing or panicking
    /// entries are removed and stopped. Checked entries are held as in use
    /// meanwhile so nobody acquires them mid-check.
    pub async fn health_check(&self) -> usize {
        let checked: Vec<(u64, Arc<dyn SandboxProvider>)> = {
            let mut state = self.shared.lock();
            state
                .entries
                .iter_mut()
                .filter(|e| !e.in_use)
                .map(|e| {
                    e.in_use = true;
                    (e.id, e.instance.clone())
                })
                .collect()
        };
        if checked.is_empty() {
            return 0;
        }

        let probes = checked.iter().map(|(id, instance)| {
            let instance = instance.clone();
            let id = *id;
            async move {
                let healthy = tokio::spawn(async move { instance.health_check().await })
                    .await
                    .unwrap_or(false);
                (id, healthy)
            }
        });
        let results = join_all(probes).await;

        let unhealthy: Vec<PoolEntry> = {
            let mut state = self.shared.lock();
            let closed = state.closed;
            let mut removed = Vec::new();
            for (id, healthy) in results {
                let Some(idx) = state.entries.iter().position(|e| e.id == id) else {
                    continue;
                };
                if healthy && !closed {
                    state.entries[idx].in_use = false;
                } else {
                    removed.push(state.entries.remove(idx));
                }
            }
            removed
        };
        let count = unhealthy.len();
        for entry in unhealthy {
            tracing::warn!(provider = %entry.provider_type, id = entry.id, "pooled sandbox failed health check");
            if let Err(e) = entry.instance.stop().await {
                tracing::debug!(provider = %entry.provider_type, error = %e, "stop after failed health check");
            }
        }
        self.shared.released.notify_waiters();
        count
    }

    /// Periodically evict expired and unhealthy idle entries. The task ends
    /// once the pool is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<SandboxPool> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                let evicted = pool.evict_idle().await;
                let unhealthy = pool.health_check().await;
                if evicted + unhealthy > 0 {
                    tracing::info!(evicted, unhealthy, "pool sweep removed sandboxes");
                }
            }
        })
    }

    /// Stop every idle entry. In-use entries stay checked out.
    pub async fn drain(&self) -> usize {
        let idle: Vec<PoolEntry> = {
            let mut state = self.shared.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| !e.in_use);
            state.entries = busy;
            idle
        };
        let count = idle.len();
        for entry in idle {
            if let Err(e) = entry.instance.stop().await {
                tracing::warn!(provider = %entry.provider_type, error = %e, "failed to stop drained instance");
            }
        }
        self.shared.released.notify_waiters();
        count
    }

    /// Drain and refuse further acquisitions. Entries still checked out are
    /// stopped when released.
    pub async fn close(&self) -> usize {
        self.shared.lock().closed = true;
        self.drain().await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let mut stats = PoolStats::default();
        for entry in &state.entries {
            stats.total += 1;
            if entry.in_use {
                stats.in_use += 1;
            } else {
                stats.idle += 1;
            }
            *stats.by_type.entry(entry.provider_type.clone()).or_insert(0) += 1;
        }
        stats
    }
}
