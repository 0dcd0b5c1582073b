//! Outbound connection pool
//!
//! Connections are kept by the shared `reqwest::Client`, which pools per
//! scheme/host/port with a bounded idle count and idle eviction. On top of
//! that each target gets a soft cap on concurrent requests: past the cap a
//! request waits up to `queue_wait` for a slot, then opens a fresh
//! connection anyway.

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Slot held for the lifetime of one upstream exchange
#[derive(Debug)]
pub struct TargetSlot {
    permit: Option<OwnedSemaphorePermit>,
}

impl TargetSlot {
    /// Whether the request got a slot under the soft cap
    pub fn within_cap(&self) -> bool {
        self.permit.is_some()
    }
}

pub struct UpstreamPool {
    client: reqwest::Client,
    slots: DashMap<String, Arc<Semaphore>>,
    max_per_target: usize,
    queue_wait: Duration,
}

impl UpstreamPool {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ProxyError::InvalidConfig(format!("failed to build upstream client: {}", e)))?;

        info!(
            max_idle_per_host = config.max_idle_per_host,
            pool_idle_timeout_ms = config.pool_idle_timeout_ms,
            max_connections_per_target = config.max_connections_per_target,
            "Upstream pool configured"
        );

        Ok(Self {
            client,
            slots: DashMap::new(),
            max_per_target: config.max_connections_per_target,
            queue_wait: config.queue_wait(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Take a slot for `target`, queueing briefly when the soft cap is hit
    pub async fn acquire(&self, target: &str) -> TargetSlot {
        let semaphore = self
            .slots
            .entry(target.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_target)))
            .clone();

        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return TargetSlot { permit: Some(permit) };
        }

        match tokio::time::timeout(self.queue_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => TargetSlot { permit: Some(permit) },
            _ => {
                debug!(upstream = %target, "Soft cap reached, opening an extra connection");
                TargetSlot { permit: None }
            }
        }
    }

    /// Slots currently free for `target`
    pub fn available(&self, target: &str) -> usize {
        self.slots
            .get(&target.to_ascii_lowercase())
            .map(|s| s.available_permits())
            .unwrap_or(self.max_per_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize, queue_wait_ms: u64) -> UpstreamPool {
        let config = UpstreamConfig {
            max_connections_per_target: max,
            queue_wait_ms,
            ..UpstreamConfig::default()
        };
        UpstreamPool::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_slots_are_per_target() {
        let pool = pool(2, 10);
        let a = pool.acquire("a.example.com").await;
        let _b = pool.acquire("b.example.com").await;
        assert!(a.within_cap());
        assert_eq!(pool.available("a.example.com"), 1);
        assert_eq!(pool.available("b.example.com"), 1);

        drop(a);
        assert_eq!(pool.available("a.example.com"), 2);
    }

    #[tokio::test]
    async fn test_over_cap_proceeds_after_queue_wait() {
        let pool = pool(1, 20);
        let first = pool.acquire("api.example.com").await;
        assert!(first.within_cap());

        let started = std::time::Instant::now();
        let second = pool.acquire("api.example.com").await;
        assert!(!second.within_cap());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_queued_request_gets_released_slot() {
        let pool = Arc::new(pool(1, 2_000));
        let first = pool.acquire("api.example.com").await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("api.example.com").await.within_cap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        assert!(waiter.await.unwrap());
    }
}
