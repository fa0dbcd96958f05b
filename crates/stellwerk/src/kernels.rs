//! Built-in kernel bodies.

use std::sync::Arc;

use tracing::info;

use crate::kernel::{KernelRegistry, TaskContext};

/// The registry shipped with the binaries.
pub fn builtin_registry() -> Arc<KernelRegistry> {
    let registry = KernelRegistry::new();

    registry.register("noop", |_ctx| async { Ok(()) });

    // Each member contributes a pseudo-random sample derived from its
    // group rank, the vector is allgathered, every member adds its own
    // sample to each element, and the element sum is reduced to the
    // leader.
    registry.register("rand_reduce", |ctx: Arc<dyn TaskContext>| async move {
        let group = ctx.group();
        let sample = rank_sample(group.rank());

        let gathered: Vec<u64> = group.allgather(sample).await?;
        info!(tid = %ctx.tid(), rank = group.rank(), ?gathered, "gathered samples");

        let local: u64 = gathered.iter().map(|v| v + sample).sum();
        let total = group.reduce(local, |a, b| a + b).await?;

        if let Some(total) = total {
            info!(tid = %ctx.tid(), total, "reduction complete");
        }
        Ok(())
    });

    Arc::new(registry)
}

/// Deterministic per-rank sample in `0..100` (Knuth multiplicative hash).
fn rank_sample(rank: usize) -> u64 {
    (rank as u64)
        .wrapping_mul(2654435761)
        .wrapping_add(12345)
        % 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = builtin_registry();
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["noop".to_string(), "rand_reduce".to_string()]);
    }

    #[test]
    fn samples_are_deterministic_and_bounded() {
        for rank in 0..16 {
            let sample = rank_sample(rank);
            assert!(sample < 100);
            assert_eq!(sample, rank_sample(rank));
        }
    }
}
