#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use vdipool::{MemoryAdapter, PoolConfig, PoolManager, PoolTuning, RetryPolicy};

/// Default tuning with fast retries.
pub fn test_tuning() -> PoolTuning {
    PoolTuning {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
        },
        ..PoolTuning::default()
    }
}

pub fn dynamic_pool(max: usize, spare: usize) -> PoolConfig {
    PoolConfig::new("eng", "win11-gold", max)
        .with_bounds(0, max, spare)
        .with_network("lan")
}

pub fn memory_pool(config: PoolConfig, tuning: PoolTuning) -> (Arc<MemoryAdapter>, PoolManager) {
    let adapter = Arc::new(MemoryAdapter::new());
    let pool = PoolManager::new(config, tuning, adapter.clone()).expect("Failed to create pool");
    (adapter, pool)
}

/// Waits until no member is provisioning or being destroyed.
pub async fn settle(pool: &PoolManager) {
    for _ in 0..2000 {
        let stats = pool.stats();
        if stats.provisioning == 0 && stats.draining == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool did not settle: {:?}", pool.stats());
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}
