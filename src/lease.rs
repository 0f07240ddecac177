use core::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of a worker lease, unique within one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("lease-{_0}")]
pub struct LeaseId(u64);

/// Identifier of the lease pool of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("lease-pool-{_0}")]
pub(crate) struct LeasePoolId(u64);

/// Per-thread permit to execute units of work.
///
/// A lease belongs to exactly one thread; holding `&mut WorkerLease` is what
/// "locked by the current thread" means. Locking and unlocking only happen
/// under the executor's coordination lock, against the pool that bounds how
/// many leases may be held at once.
#[must_use]
#[derive(Debug)]
pub struct WorkerLease {
    id: LeaseId,
    pool: LeasePoolId,
    locked: bool,
}

impl WorkerLease {
    /// Identifier of this lease.
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Whether the owning thread currently holds this lease.
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.locked
    }

    pub(crate) fn pool(&self) -> LeasePoolId {
        self.pool
    }

    /// Non-blocking acquisition. Succeeds immediately if already held.
    pub(crate) fn try_lock(&mut self, pool: &mut LeasePool) -> bool {
        debug_assert_eq!(self.pool, pool.id, "{} used with a foreign lease pool", self.id);
        if self.locked {
            return true;
        }
        if pool.locked >= pool.max.get() {
            return false;
        }
        pool.locked += 1;
        self.locked = true;
        true
    }

    /// Releases the lease. Returns `false` if it was not held, `true` if a
    /// slot was handed back to the pool and waiting threads should be told.
    pub(crate) fn unlock(&mut self, pool: &mut LeasePool) -> bool {
        debug_assert_eq!(self.pool, pool.id, "{} used with a foreign lease pool", self.id);
        if !self.locked {
            return false;
        }
        self.locked = false;
        pool.locked -= 1;
        true
    }
}

/// Accounting of how many leases are held, bounded by the worker count.
#[derive(Debug)]
pub(crate) struct LeasePool {
    id: LeasePoolId,
    max: NonZeroUsize,
    locked: usize,
    next_id: u64,
}

impl LeasePool {
    pub(crate) fn new(max: NonZeroUsize) -> Self {
        Self {
            id: LeasePoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            max,
            locked: 0,
            next_id: 0,
        }
    }

    pub(crate) fn id(&self) -> LeasePoolId {
        self.id
    }

    pub(crate) fn new_lease(&mut self) -> WorkerLease {
        let id = LeaseId(self.next_id);
        self.next_id += 1;
        WorkerLease {
            id,
            pool: self.id,
            locked: false,
        }
    }

    pub(crate) fn locked(&self) -> usize {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> LeasePool {
        LeasePool::new(NonZeroUsize::new(max).unwrap())
    }

    #[test]
    fn try_lock_respects_the_bound() {
        let mut pool = pool(2);
        let mut a = pool.new_lease();
        let mut b = pool.new_lease();
        let mut c = pool.new_lease();
        assert_ne!(a.id(), b.id());

        assert!(a.try_lock(&mut pool));
        assert!(b.try_lock(&mut pool));
        assert!(!c.try_lock(&mut pool));
        assert_eq!(pool.locked(), 2);

        assert!(a.unlock(&mut pool));
        assert!(c.try_lock(&mut pool));
        assert!(c.is_locked_by_current_thread());
        assert!(!a.is_locked_by_current_thread());
    }

    #[test]
    fn relocking_and_double_unlock_are_noops() {
        let mut pool = pool(1);
        let mut lease = pool.new_lease();
        assert!(lease.try_lock(&mut pool));
        assert!(lease.try_lock(&mut pool));
        assert_eq!(pool.locked(), 1);

        assert!(lease.unlock(&mut pool));
        assert!(!lease.unlock(&mut pool));
        assert_eq!(pool.locked(), 0);
    }

    #[test]
    fn leases_remember_their_pool() {
        let mut first = pool(1);
        let mut second = pool(1);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.new_lease().pool(), first.id());
        assert_eq!(second.new_lease().pool(), second.id());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "foreign lease pool")]
    fn locking_against_another_pool_is_rejected() {
        let mut first = pool(1);
        let mut second = pool(1);
        let mut lease = first.new_lease();
        lease.try_lock(&mut second);
    }
}
