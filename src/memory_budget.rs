//! Process-wide semaphore over named byte pools (spec §4.3).
//!
//! Replaces the source's global singleton with an explicit, cloneable
//! handle threaded through construction (DESIGN NOTES §9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

/// The pool every `SinkPipeline` shares, so a fast source backpressures
/// the whole agent rather than just its own instance.
pub const AGENT_GLOBAL_WRITER_PERMIT: &str = "AGENT_GLOBAL_WRITER_PERMIT";

struct Pool {
    capacity: u64,
    used: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryBudget {
    pools: Arc<DashMap<String, Pool>>,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBudget {
    pub fn new() -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
        }
    }

    /// Registers a pool with a fixed capacity. Idempotent: re-registering
    /// an existing pool is a no-op so multiple sinks can race to set up
    /// the shared writer-permit pool at startup.
    pub fn register_pool(&self, pool: &str, capacity: u64) {
        self.pools.entry(pool.to_string()).or_insert_with(|| Pool {
            capacity,
            used: AtomicU64::new(0),
        });
    }

    /// Non-blocking; `false` if `used + n > capacity`. Unknown pools have
    /// no capacity and always fail.
    pub fn try_acquire(&self, pool: &str, n: u64) -> bool {
        let Some(entry) = self.pools.get(pool) else {
            return false;
        };
        let mut current = entry.used.load(Ordering::Acquire);
        loop {
            if current.saturating_add(n) > entry.capacity {
                return false;
            }
            match entry.used.compare_exchange_weak(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Precondition: `n <= used`. Never blocks.
    pub fn release(&self, pool: &str, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(entry) = self.pools.get(pool) {
            entry.used.fetch_sub(n, Ordering::AcqRel);
        }
    }

    pub fn used(&self, pool: &str) -> u64 {
        self.pools
            .get(pool)
            .map(|p| p.used.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn capacity(&self, pool: &str) -> u64 {
        self.pools.get(pool).map(|p| p.capacity).unwrap_or(0)
    }

    /// Observability hook.
    pub fn report(&self, pool: &str, tag: &str) {
        let used = self.used(pool);
        let capacity = self.capacity(pool);
        trace!(pool, tag, used, capacity, "memory budget report");
        metrics::gauge!("memory_budget_used_bytes", "pool" => pool.to_string()).set(used as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_capacity() {
        let budget = MemoryBudget::new();
        budget.register_pool("p", 200);
        assert!(budget.try_acquire("p", 100));
        assert!(budget.try_acquire("p", 100));
        assert!(!budget.try_acquire("p", 1));
        budget.release("p", 100);
        assert!(budget.try_acquire("p", 100));
    }

    #[test]
    fn unknown_pool_never_acquires() {
        let budget = MemoryBudget::new();
        assert!(!budget.try_acquire("missing", 1));
    }
}
