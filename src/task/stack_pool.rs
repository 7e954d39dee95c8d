//! Stack accounting pool.
//!
//! The thread-backed execution context owns its stacks (they are thread
//! stacks), so the pool's job here is admission control and accounting: it
//! enforces the configured limits, tracks used/retained counts, and surfaces
//! exhaustion at the creation factory — a task is either fully created or
//! not created at all, never half-built.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskError;

/// Default stack reservation for tasks created without an explicit size.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Tuning knobs for a [`StackPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPoolConfig {
    /// Maximum number of stacks simultaneously in use. Zero means unlimited.
    pub max_stack_count: usize,
    /// Maximum total bytes simultaneously in use. Zero means unlimited.
    pub max_total_size: usize,
    /// Number of released stack records retained for reuse accounting.
    pub min_retained_count: usize,
    /// Upper bound on records released per [`StackPool::gc`] call.
    pub gc_batch_size: usize,
}

impl StackPoolConfig {
    /// Unlimited pool with a small retained set.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_stack_count: 0,
            max_total_size: 0,
            min_retained_count: 16,
            gc_batch_size: 16,
        }
    }

    /// Sets the maximum concurrent stack count.
    #[must_use]
    pub const fn with_max_stack_count(mut self, count: usize) -> Self {
        self.max_stack_count = count;
        self
    }

    /// Sets the maximum total in-use bytes.
    #[must_use]
    pub const fn with_max_total_size(mut self, bytes: usize) -> Self {
        self.max_total_size = bytes;
        self
    }

    /// Sets the retained-record floor kept across gc passes.
    #[must_use]
    pub const fn with_min_retained_count(mut self, count: usize) -> Self {
        self.min_retained_count = count;
        self
    }

    /// Sets the per-gc release batch bound.
    #[must_use]
    pub const fn with_gc_batch_size(mut self, count: usize) -> Self {
        self.gc_batch_size = count;
        self
    }
}

impl Default for StackPoolConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    used_count: usize,
    used_size: usize,
    retained: Vec<usize>,
}

/// Admission-controlled stack accounting, shared by reference.
#[derive(Debug)]
pub struct StackPool {
    config: StackPoolConfig,
    state: Mutex<PoolState>,
}

impl StackPool {
    /// Creates a pool with the given configuration.
    #[must_use]
    pub fn new(config: StackPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Reserves one stack of `size` bytes.
    ///
    /// Fails with [`TaskError::StackExhausted`] when either configured limit
    /// would be exceeded; nothing is reserved in that case.
    pub fn acquire(self: &Arc<Self>, size: usize) -> Result<StackLease, TaskError> {
        let mut state = self.state.lock();
        if self.config.max_stack_count != 0 && state.used_count + 1 > self.config.max_stack_count {
            return Err(TaskError::StackExhausted);
        }
        if self.config.max_total_size != 0 && state.used_size + size > self.config.max_total_size {
            return Err(TaskError::StackExhausted);
        }
        state.used_count += 1;
        state.used_size += size;
        Ok(StackLease {
            pool: Arc::clone(self),
            size,
        })
    }

    /// Number of stacks currently in use.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.state.lock().used_count
    }

    /// Number of released stack records retained.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().retained.len()
    }

    /// Total bytes currently in use.
    #[must_use]
    pub fn used_size(&self) -> usize {
        self.state.lock().used_size
    }

    /// Releases retained records above the configured floor, at most one gc
    /// batch per call. Returns how many records were dropped.
    pub fn gc(&self) -> usize {
        let mut state = self.state.lock();
        let floor = self.config.min_retained_count;
        if state.retained.len() <= floor {
            return 0;
        }
        let excess = state.retained.len() - floor;
        let dropped = excess.min(self.config.gc_batch_size.max(1));
        let new_len = state.retained.len() - dropped;
        state.retained.truncate(new_len);
        dropped
    }

    fn release(&self, size: usize) {
        let mut state = self.state.lock();
        state.used_count = state.used_count.saturating_sub(1);
        state.used_size = state.used_size.saturating_sub(size);
        state.retained.push(size);
    }
}

/// A reserved stack; releasing happens on drop.
#[derive(Debug)]
pub struct StackLease {
    pool: Arc<StackPool>,
    size: usize,
}

impl StackLease {
    /// The reserved size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for StackLease {
    fn drop(&mut self) {
        self.pool.release(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trips_counts() {
        let pool = StackPool::new(StackPoolConfig::unbounded());
        assert_eq!(pool.used_count(), 0);
        let lease = pool.acquire(4096).expect("unbounded pool");
        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.used_size(), 4096);
        drop(lease);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.used_size(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn count_limit_is_enforced() {
        let pool = StackPool::new(StackPoolConfig::unbounded().with_max_stack_count(1));
        let lease = pool.acquire(1024).expect("first fits");
        assert_eq!(pool.acquire(1024).unwrap_err(), TaskError::StackExhausted);
        drop(lease);
        assert!(pool.acquire(1024).is_ok());
    }

    #[test]
    fn size_limit_is_enforced() {
        let pool = StackPool::new(StackPoolConfig::unbounded().with_max_total_size(4096));
        let _a = pool.acquire(3072).expect("fits");
        assert_eq!(pool.acquire(2048).unwrap_err(), TaskError::StackExhausted);
        assert!(pool.acquire(1024).is_ok());
    }

    #[test]
    fn gc_respects_floor_and_batch() {
        let pool = StackPool::new(
            StackPoolConfig::unbounded()
                .with_min_retained_count(1)
                .with_gc_batch_size(2),
        );
        for _ in 0..5 {
            let lease = pool.acquire(64).expect("unbounded");
            drop(lease);
        }
        assert_eq!(pool.free_count(), 5);
        assert_eq!(pool.gc(), 2);
        assert_eq!(pool.gc(), 2);
        assert_eq!(pool.gc(), 0);
        assert_eq!(pool.free_count(), 1);
    }
}
