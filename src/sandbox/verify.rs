//! Memoized "does this backend actually work here" checks.
//!
//! Availability is not correctness: a binary can be on PATH and still fail
//! to start a guest. Providers whose metadata sets `requires_verification`
//! get their `verify()` probe run once per provider type for the lifetime of
//! the cache. Negative outcomes are cached too.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use super::types::ProviderType;

#[derive(Debug, Default)]
pub struct VerificationCache {
    entries: Mutex<HashMap<ProviderType, Arc<OnceCell<bool>>>>,
}

impl VerificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, provider_type: &ProviderType) -> Arc<OnceCell<bool>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(provider_type.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Return the cached outcome, running `probe` only if none exists.
    /// Concurrent callers for the same type share a single probe.
    pub async fn verify<F>(&self, provider_type: &ProviderType, probe: F) -> bool
    where
        F: Future<Output = bool>,
    {
        let cell = self.cell(provider_type);
        *cell
            .get_or_init(|| async move {
                let ok = probe.await;
                tracing::info!(provider = %provider_type, verified = ok, "runtime verification finished");
                ok
            })
            .await
    }

    pub fn cached(&self, provider_type: &ProviderType) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(provider_type).and_then(|cell| cell.get().copied())
    }

    /// Forget one provider's outcome so the next check probes again.
    pub fn invalidate(&self, provider_type: &ProviderType) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(provider_type);
    }

    pub fn reset(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    async fn counted_probe(calls: &AtomicUsize, result: bool) -> bool {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        result
    }

    #[tokio::test]
    async fn positive_result_is_cached() {
        let cache = VerificationCache::new();
        let calls = AtomicUsize::new(0);
        assert!(cache.verify(&ProviderType::BOXLITE, counted_probe(&calls, true)).await);
        assert!(cache.verify(&ProviderType::BOXLITE, counted_probe(&calls, false)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached(&ProviderType::BOXLITE), Some(true));
    }

    #[tokio::test]
    async fn negative_result_is_cached() {
        let cache = VerificationCache::new();
        let calls = AtomicUsize::new(0);
        assert!(!cache.verify(&ProviderType::BOXLITE, counted_probe(&calls, false)).await);
        assert!(!cache.verify(&ProviderType::BOXLITE, counted_probe(&calls, true)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_probe() {
        let cache = Arc::new(VerificationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .verify(&ProviderType::DOCKER, counted_probe(&calls, true))
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn types_are_cached_independently() {
        let cache = VerificationCache::new();
        let calls = AtomicUsize::new(0);
        cache.verify(&ProviderType::DOCKER, counted_probe(&calls, true)).await;
        cache.verify(&ProviderType::BOXLITE, counted_probe(&calls, false)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.cached(&ProviderType::E2B), None);
    }

    #[tokio::test]
    async fn invalidate_and_reset_force_a_new_probe() {
        let cache = VerificationCache::new();
        let calls = AtomicUsize::new(0);
        cache.verify(&ProviderType::DOCKER, counted_probe(&calls, false)).await;
        cache.invalidate(&ProviderType::DOCKER);
        assert!(cache.verify(&ProviderType::DOCKER, counted_probe(&calls, true)).await);
        cache.reset();
        assert_eq!(cache.cached(&ProviderType::DOCKER), None);
        cache.verify(&ProviderType::DOCKER, counted_probe(&calls, true)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
