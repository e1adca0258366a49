//! Driver endpoint registry.
//!
//! Drivers register their backend location once at startup; the enrichment
//! path resolves it on every request. Registration is idempotent: re-posting
//! an identical entry succeeds silently, while an entry with different
//! connection info for the same name is a conflict.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::info;

use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::DriverEndpoint;

/// Registry of driver backend endpoints, keyed by driver name cluster-wide.
#[async_trait]
pub trait DriverRegistry: Send + Sync {
    /// Registers a driver endpoint. Succeeds silently when an identical
    /// entry already exists; fails with `Conflict` when the existing entry
    /// has different connection info.
    async fn register(&self, endpoint: DriverEndpoint) -> DeltaResult<DriverEndpoint>;

    /// Resolves a driver name to its endpoint. Fails with `NotFound` when
    /// unregistered.
    async fn resolve(&self, driver_name: &str) -> DeltaResult<DriverEndpoint>;

    /// Returns all registered endpoints, ordered by driver name.
    async fn list(&self) -> DeltaResult<Vec<DriverEndpoint>>;
}

/// In-memory driver registry.
#[derive(Default)]
pub struct MemoryDriverRegistry {
    endpoints: DashMap<String, DriverEndpoint>,
}

impl MemoryDriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriverRegistry for MemoryDriverRegistry {
    async fn register(&self, endpoint: DriverEndpoint) -> DeltaResult<DriverEndpoint> {
        endpoint.validate()?;

        match self.endpoints.entry(endpoint.driver_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if *existing.get() == endpoint {
                    Ok(existing.get().clone())
                } else {
                    Err(DeltaError::with_message(
                        ErrorCode::Conflict,
                        format!(
                            "driver {} is already registered with different connection info",
                            endpoint.driver_name
                        ),
                    ))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(driver = %endpoint.driver_name, "registered driver endpoint");
                slot.insert(endpoint.clone());
                Ok(endpoint)
            }
        }
    }

    async fn resolve(&self, driver_name: &str) -> DeltaResult<DriverEndpoint> {
        self.endpoints
            .get(driver_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                DeltaError::with_message(
                    ErrorCode::NotFound,
                    format!("driver {driver_name} is not registered"),
                )
            })
    }

    async fn list(&self) -> DeltaResult<Vec<DriverEndpoint>> {
        let mut endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| e.value().clone())
            .collect();
        endpoints.sort_by(|a, b| a.driver_name.cmp(&b.driver_name));
        Ok(endpoints)
    }
}

/// Bounded retry policy for driver registration racing registry readiness.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Overall budget; expiry is fatal to the registering driver.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Registers a driver endpoint, retrying on a fixed interval until success
/// or the overall deadline.
///
/// Idempotency errors do not occur here (an identical existing entry is a
/// success); `Conflict` from differing connection info and validation errors
/// fail immediately, since retrying cannot fix them.
pub async fn register_with_retry(
    registry: &dyn DriverRegistry,
    endpoint: DriverEndpoint,
    policy: RetryPolicy,
) -> DeltaResult<DriverEndpoint> {
    let started = tokio::time::Instant::now();
    loop {
        match registry.register(endpoint.clone()).await {
            Ok(created) => return Ok(created),
            Err(e) if matches!(e.code, ErrorCode::Conflict | ErrorCode::InvalidInput) => {
                return Err(e)
            }
            Err(e) => {
                if started.elapsed() + policy.interval > policy.deadline {
                    return Err(DeltaError::with_message(
                        e.code,
                        format!(
                            "giving up registering driver {} after {:?}: {}",
                            endpoint.driver_name, policy.deadline, e.message
                        ),
                    ));
                }
                info!(
                    driver = %endpoint.driver_name,
                    error = %e,
                    "retrying driver registration"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn endpoint_a() -> DriverEndpoint {
        DriverEndpoint::with_url("example.csi.dev", "http://backend-a:8080")
    }

    fn endpoint_b() -> DriverEndpoint {
        DriverEndpoint::with_url("example.csi.dev", "http://backend-b:8080")
    }

    #[tokio::test]
    async fn resolve_on_empty_registry_is_not_found() {
        let registry = MemoryDriverRegistry::new();
        let err = registry.resolve("missing-driver").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn register_is_idempotent_for_identical_entries() {
        let registry = MemoryDriverRegistry::new();
        registry.register(endpoint_a()).await.unwrap();
        registry.register(endpoint_a()).await.unwrap();

        let resolved = registry.resolve("example.csi.dev").await.unwrap();
        assert_eq!(resolved, endpoint_a());
    }

    #[tokio::test]
    async fn register_conflicts_on_differing_connection_info() {
        let registry = MemoryDriverRegistry::new();
        registry.register(endpoint_a()).await.unwrap();

        let err = registry.register(endpoint_b()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);

        // The original entry is untouched.
        let resolved = registry.resolve("example.csi.dev").await.unwrap();
        assert_eq!(resolved, endpoint_a());
    }

    /// Registry stub that fails a fixed number of attempts before accepting.
    struct FlakyRegistry {
        failures_left: AtomicU32,
        inner: MemoryDriverRegistry,
    }

    #[async_trait]
    impl DriverRegistry for FlakyRegistry {
        async fn register(&self, endpoint: DriverEndpoint) -> DeltaResult<DriverEndpoint> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(DeltaError::new(ErrorCode::UpstreamUnavailable));
            }
            self.inner.register(endpoint).await
        }

        async fn resolve(&self, driver_name: &str) -> DeltaResult<DriverEndpoint> {
            self.inner.resolve(driver_name).await
        }

        async fn list(&self) -> DeltaResult<Vec<DriverEndpoint>> {
            self.inner.list().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registration_retries_until_the_registry_accepts() {
        let registry = FlakyRegistry {
            failures_left: AtomicU32::new(3),
            inner: MemoryDriverRegistry::new(),
        };

        let policy = RetryPolicy {
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(300),
        };
        register_with_retry(&registry, endpoint_a(), policy)
            .await
            .unwrap();
        assert!(registry.resolve("example.csi.dev").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_fails_past_the_deadline() {
        let registry = FlakyRegistry {
            failures_left: AtomicU32::new(u32::MAX),
            inner: MemoryDriverRegistry::new(),
        };

        let policy = RetryPolicy {
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(20),
        };
        let err = register_with_retry(&registry, endpoint_a(), policy)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn registration_conflict_is_not_retried() {
        let registry = MemoryDriverRegistry::new();
        registry.register(endpoint_a()).await.unwrap();

        let err = register_with_retry(&registry, endpoint_b(), RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }
}
