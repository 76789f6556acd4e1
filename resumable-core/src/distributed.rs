//! Cross-process synchronization used around restore boundaries.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use crate::config::{DistributedConfig, DistributedMode};
use crate::error::{CheckpointError, Result};

/// Collective operations provided by the distributed runtime.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every process in the group has called `barrier`.
    fn barrier(&self) -> Result<()>;

    /// Block until every device in the mesh has reached the rendezvous `tag`.
    fn rendezvous(&self, tag: &str) -> Result<()>;

    /// Whether this is the process responsible for preemption saves.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// A lone process: every collective returns immediately.
#[derive(Debug, Clone, Copy)]
pub struct SingleProcess {
    rank: usize,
}

impl SingleProcess {
    pub fn new() -> Self {
        Self { rank: 0 }
    }

    /// A single process that reports a fixed rank, for exercising non-leader paths.
    pub fn with_rank(rank: usize) -> Self {
        Self { rank }
    }

    pub fn from_config(config: &DistributedConfig) -> Self {
        Self::with_rank(config.rank)
    }
}

impl Default for SingleProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn rendezvous(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// Workers running as threads of one process, synchronized by a shared barrier.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
    /// Rendezvous tag last announced by each rank.
    tags: Arc<Mutex<Vec<String>>>,
}

impl ThreadGroup {
    /// One handle per rank, all sharing the same barrier.
    pub fn create(world_size: usize) -> Vec<ThreadGroup> {
        let barrier = Arc::new(Barrier::new(world_size));
        let tags = Arc::new(Mutex::new(vec![String::new(); world_size]));
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                barrier: Arc::clone(&barrier),
                tags: Arc::clone(&tags),
            })
            .collect()
    }

    fn lock_tags(&self) -> Result<MutexGuard<'_, Vec<String>>> {
        self.tags
            .lock()
            .map_err(|_| CheckpointError::Distributed("rendezvous state poisoned".to_string()))
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    /// Every rank must arrive with the same `tag`; a rank that reached a
    /// different rendezvous fails the collective on all ranks.
    fn rendezvous(&self, tag: &str) -> Result<()> {
        tracing::trace!(rank = self.rank, tag, "rendezvous");
        self.lock_tags()?[self.rank] = tag.to_string();
        self.barrier.wait();
        let mismatch = self
            .lock_tags()?
            .iter()
            .enumerate()
            .find(|(_, other)| other.as_str() != tag)
            .map(|(rank, other)| (rank, other.clone()));
        // Tags stay untouched until every rank has compared them.
        self.barrier.wait();

        match mismatch {
            Some((rank, other)) => Err(CheckpointError::Distributed(format!(
                "rank {} reached rendezvous '{tag}' but rank {rank} reached '{other}'",
                self.rank
            ))),
            None => Ok(()),
        }
    }
}

/// Wait for all processes after a restore, according to `mode`.
pub fn synchronize(mode: DistributedMode, group: &dyn ProcessGroup, tag: &str) -> Result<()> {
    match mode {
        DistributedMode::None => Ok(()),
        DistributedMode::Ddp | DistributedMode::Ddp2 => {
            tracing::debug!(rank = group.rank(), "Waiting at barrier");
            group.barrier()
        }
        DistributedMode::Tpu => {
            tracing::debug!(rank = group.rank(), tag, "Waiting at rendezvous");
            group.rendezvous(tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_single_process() {
        let group = SingleProcess::new();
        assert!(group.is_leader());
        assert_eq!(group.world_size(), 1);
        assert!(synchronize(DistributedMode::Ddp, &group, "t").is_ok());
        assert!(!SingleProcess::with_rank(2).is_leader());
    }

    #[test]
    fn test_thread_group_barrier_blocks_until_all_arrive() {
        let arrived = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = ThreadGroup::create(4)
            .into_iter()
            .map(|group| {
                let arrived = Arc::clone(&arrived);
                thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    synchronize(DistributedMode::Ddp, &group, "restore").unwrap();
                    // Nobody passes the barrier before everyone has arrived.
                    assert_eq!(arrived.load(Ordering::SeqCst), 4);
                    group.rank()
                })
            })
            .collect();

        let mut ranks: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rendezvous_with_matching_tags() {
        let handles: Vec<_> = ThreadGroup::create(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || synchronize(DistributedMode::Tpu, &group, "restore"))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn test_rendezvous_with_mismatched_tags_fails_everywhere() {
        let handles: Vec<_> = ThreadGroup::create(2)
            .into_iter()
            .map(|group| {
                let tag = if group.rank() == 0 { "restore" } else { "save" };
                thread::spawn(move || group.rendezvous(tag))
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, CheckpointError::Distributed(_)));
        }
    }
}
