//! # Health Registry
//!
//! Named liveness predicates registered during startup and read by the HTTP layer.
//! Every predicate is awaited concurrently under its own timeout; one that panics or
//! times out reports `false` for its own name and does not affect the others.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::lifecycle::{contain, contain_sync};

pub type HealthPredicate = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

pub struct HealthRegistry {
    entries: RwLock<BTreeMap<String, HealthPredicate>>,
    check_timeout: Duration,
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("services", &self.names())
            .field("check_timeout", &self.check_timeout)
            .finish()
    }
}

impl HealthRegistry {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            check_timeout,
        }
    }

    /// Register an async predicate under `name`, replacing any previous one
    pub fn register<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        self.entries.write().insert(name.into(), Arc::new(predicate));
    }

    /// Register a synchronous predicate
    pub fn register_sync<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.register(name, move || {
            let predicate = predicate.clone();
            async move { predicate() }.boxed()
        });
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evaluate every predicate
    pub async fn check_all(&self) -> BTreeMap<String, bool> {
        let entries: Vec<(String, HealthPredicate)> = self
            .entries
            .read()
            .iter()
            .map(|(name, predicate)| (name.clone(), predicate.clone()))
            .collect();

        let timeout = self.check_timeout;
        let checks = entries.into_iter().map(|(name, predicate)| async move {
            let healthy = evaluate(&name, predicate, timeout).await;
            (name, healthy)
        });

        join_all(checks).await.into_iter().collect()
    }

    pub async fn all_healthy(&self) -> bool {
        self.check_all().await.values().all(|healthy| *healthy)
    }
}

async fn evaluate(name: &str, predicate: HealthPredicate, timeout: Duration) -> bool {
    // Building the future can panic as well as polling it
    let check = match contain_sync(|| predicate()) {
        Ok(check) => check,
        Err(_) => {
            warn!(service = %name, "Health predicate panicked");
            return false;
        }
    };

    match tokio::time::timeout(timeout, contain(check)).await {
        Ok(Ok(healthy)) => healthy,
        Ok(Err(_)) => {
            warn!(service = %name, "Health predicate panicked");
            false
        }
        Err(_) => {
            warn!(
                service = %name,
                timeout_ms = timeout.as_millis() as u64,
                "Health predicate timed out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn failing_probe() -> bool {
        panic!("probe failed")
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_service() {
        let registry = HealthRegistry::new(Duration::from_millis(50));
        registry.register_sync("healthy", || true);
        registry.register_sync("unhealthy", || false);
        registry.register("slow", || {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                true
            }
            .boxed()
        });
        registry.register("panics", || async { failing_probe() }.boxed());

        let report = registry.check_all().await;
        assert_eq!(report.len(), 4);
        assert!(report["healthy"]);
        assert!(!report["unhealthy"]);
        assert!(!report["slow"]);
        assert!(!report["panics"]);
        assert!(!registry.all_healthy().await);
    }

    #[tokio::test]
    async fn test_last_registration_wins_and_state_is_live() {
        let registry = HealthRegistry::new(Duration::from_millis(50));
        let flag = Arc::new(AtomicBool::new(true));
        registry.register_sync("analytics-ingestion", || false);
        let probe = flag.clone();
        registry.register_sync("analytics-ingestion", move || probe.load(Ordering::Acquire));

        assert_eq!(registry.names(), vec!["analytics-ingestion".to_string()]);
        assert!(registry.all_healthy().await);

        flag.store(false, Ordering::Release);
        assert!(!registry.all_healthy().await);
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new(Duration::from_millis(10));
        assert!(registry.is_empty());
        assert!(registry.all_healthy().await);
    }
}
