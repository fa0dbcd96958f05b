use std::collections::BTreeSet;

/// Index of a processing unit within its node context. Rank 0 is the
/// scheduler's own unit and never enters the pool.
pub type Rank = u32;

/// The set of processing units not currently bound to any active task.
///
/// Mutated only from the scheduler's dispatch thread. Bookkeeping here is
/// load-bearing for the whole scheduler — misuse (double release, releasing
/// a foreign rank) indicates corrupted state and fails fast rather than
/// being papered over.
#[derive(Debug)]
pub struct RankPool {
    free: BTreeSet<Rank>,
    /// Number of worker units on this node (excludes rank 0).
    capacity: usize,
}

impl RankPool {
    /// Build a pool over a node of `units` processing units, ranks
    /// `1..units`.
    pub fn new(units: u32) -> Self {
        assert!(units >= 2, "a node needs at least one worker unit");
        Self {
            free: (1..units).collect(),
            capacity: (units - 1) as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.free.contains(&rank)
    }

    /// Remove exactly `n` units from the pool, in pool iteration order.
    ///
    /// Admission must check the pool size first; asking for more units than
    /// are free is a scheduler bug.
    pub fn take(&mut self, n: usize) -> BTreeSet<Rank> {
        assert!(
            n <= self.free.len(),
            "allocating {n} units from a pool of {}",
            self.free.len()
        );
        let picked: BTreeSet<Rank> = self.free.iter().take(n).copied().collect();
        for r in &picked {
            self.free.remove(r);
        }
        tracing::trace!(taken = ?picked, free = self.free.len(), "ranks allocated");
        picked
    }

    /// Re-claim specific ranks (a resumed task's original units).
    ///
    /// Every requested rank must currently be free. A suspended task's
    /// units may have been handed to another task in the meantime; that
    /// collision is a fatal invariant violation, not a silent
    /// reallocation.
    pub fn take_exact(&mut self, ranks: &BTreeSet<Rank>) {
        for r in ranks {
            assert!(
                self.free.remove(r),
                "rank {r} re-claimed while bound to another task"
            );
        }
    }

    /// Return a task's rank set to the pool.
    pub fn release(&mut self, ranks: BTreeSet<Rank>) {
        for r in ranks {
            assert!(
                r != 0 && (r as usize) <= self.capacity,
                "rank {r} does not belong to this node"
            );
            assert!(self.free.insert(r), "rank {r} released twice");
        }
        tracing::trace!(free = self.free.len(), "ranks released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_excludes_scheduler_unit() {
        let pool = RankPool::new(5);
        assert_eq!(pool.len(), 4);
        assert!(!pool.contains(0));
        assert!(pool.contains(1) && pool.contains(4));
    }

    #[test]
    fn take_uses_iteration_order() {
        let mut pool = RankPool::new(5);
        let picked = pool.take(2);
        assert_eq!(picked, [1, 2].into_iter().collect());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn conservation_across_take_release() {
        let mut pool = RankPool::new(8);
        let a = pool.take(3);
        let b = pool.take(2);
        assert!(a.is_disjoint(&b));
        assert_eq!(pool.len() + a.len() + b.len(), pool.capacity());

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.len(), pool.capacity());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_fatal() {
        let mut pool = RankPool::new(4);
        pool.release([1].into_iter().collect());
    }

    #[test]
    #[should_panic(expected = "allocating")]
    fn overdraw_is_fatal() {
        let mut pool = RankPool::new(3);
        pool.take(3);
    }

    #[test]
    fn take_exact_reclaims_home_ranks() {
        let mut pool = RankPool::new(6);
        let home: BTreeSet<Rank> = [2, 4].into_iter().collect();
        pool.take_exact(&home);
        assert!(!pool.contains(2) && !pool.contains(4));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    #[should_panic(expected = "re-claimed while bound")]
    fn take_exact_collision_is_fatal() {
        let mut pool = RankPool::new(6);
        let first = pool.take(1);
        pool.take_exact(&first);
    }
}
