//! Worker pool whose size can change while work is in flight.
//!
//! A semaphore holds one permit per worker slot. Growing adds permits.
//! Shrinking takes idle permits out of circulation immediately and, when
//! every permit is busy, records a debt that is paid by forgetting permits
//! as running tasks release them. Running tasks are never interrupted.

use crate::error::HarvestError;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug)]
struct PoolState {
    limit: usize,
    /// Permits still to be retired once they come back.
    debt: usize,
}

#[derive(Debug)]
pub struct ElasticPool {
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    min: usize,
    max: usize,
}

/// A worker slot; returning it to the pool happens on drop.
#[derive(Debug)]
pub struct PoolPermit {
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ElasticPool>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        if state.debt > 0 {
            state.debt -= 1;
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}

impl ElasticPool {
    pub fn new(initial: usize, min: usize, max: usize) -> Arc<Self> {
        let min = min.max(1);
        let max = max.max(min);
        let initial = initial.clamp(min, max);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            state: Mutex::new(PoolState {
                limit: initial,
                debt: 0,
            }),
            min,
            max,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current target number of concurrent workers.
    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Wait for a free worker slot.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolPermit, HarvestError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| HarvestError::Internal("worker pool closed".to_string()))?;
        Ok(PoolPermit {
            permit: Some(permit),
            pool: Arc::clone(self),
        })
    }

    /// Move the limit to `target` (clamped to the pool bounds). Returns the
    /// new limit.
    pub fn set_limit(&self, target: usize) -> usize {
        let target = target.clamp(self.min, self.max);
        let mut state = self.lock();
        while state.limit < target {
            if state.debt > 0 {
                state.debt -= 1;
            } else {
                self.semaphore.add_permits(1);
            }
            state.limit += 1;
        }
        while state.limit > target {
            match self.semaphore.try_acquire() {
                Ok(idle) => idle.forget(),
                Err(_) => state.debt += 1,
            }
            state.limit -= 1;
        }
        debug!("worker limit now {} (debt {})", state.limit, state.debt);
        state.limit
    }

    pub fn grow(&self) -> usize {
        let current = self.limit();
        self.set_limit(current + 1)
    }

    pub fn shrink(&self) -> usize {
        let current = self.limit();
        self.set_limit(current.saturating_sub(1))
    }

    /// Permits available right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grow_and_shrink_idle_pool() {
        let pool = ElasticPool::new(3, 2, 5);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.grow(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.set_limit(1), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.set_limit(99), 5);
    }

    #[tokio::test]
    async fn shrink_while_busy_retires_returned_permits() {
        let pool = ElasticPool::new(2, 1, 4);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        assert_eq!(pool.shrink(), 1);
        drop(a);
        // The first permit back pays the debt.
        assert_eq!(pool.available(), 0);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn growing_cancels_outstanding_debt() {
        let pool = ElasticPool::new(2, 1, 4);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.shrink();
        pool.grow();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.limit(), 2);
    }
}
