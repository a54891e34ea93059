//! Sharded lookaside cache for hot handles.
//!
//! Each shard is a fixed eight-slot array in most-recent-first order, and a
//! thread always probes the same shard, so the common refault pattern hits
//! without touching the page tree or the mapping locks. A handle may sit in
//! several shards at once; every occupied slot owns one reference.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bh::BufferHead;
use crate::device::BlockDev;

pub(crate) const LRU_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    pub hits: u64,
    pub misses: u64,
}

struct Shard {
    slots: Mutex<[Option<Arc<BufferHead>>; LRU_SLOTS]>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Shard {
    fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

pub(crate) struct LruSet {
    shards: Box<[Shard]>,
}

static NEXT_THREAD_SEED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SEED: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_seed() -> usize {
    THREAD_SEED.with(|cell| match cell.get() {
        Some(seed) => seed,
        None => {
            let seed = NEXT_THREAD_SEED.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(seed));
            seed
        }
    })
}

impl LruSet {
    pub(crate) fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::new()).collect(),
        }
    }

    fn shard(&self) -> &Shard {
        &self.shards[thread_seed() % self.shards.len()]
    }

    /// Probes this thread's shard. A hit is promoted to the front and comes
    /// back with an extra reference for the caller.
    pub(crate) fn lookup(
        &self,
        dev: &Arc<BlockDev>,
        block: u64,
        size: usize,
    ) -> Option<Arc<BufferHead>> {
        let shard = self.shard();
        let mut slots = shard.slots.lock();
        let hit = slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|bh| {
                bh.block() == block
                    && bh.size() == size
                    && bh.dev().is_some_and(|d| Arc::ptr_eq(&d, dev))
            })
        });
        match hit {
            Some(i) => {
                slots[0..=i].rotate_right(1);
                let bh = slots[0].clone().expect("promoted slot is occupied");
                bh.get_ref();
                bh.touch();
                shard.hits.fetch_add(1, Ordering::Relaxed);
                Some(bh)
            }
            None => {
                shard.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Installs a handle at the front of this thread's shard, dropping the
    /// reference of whatever falls off the tail. Re-installing a resident
    /// handle just promotes it.
    pub(crate) fn install(&self, bh: &Arc<BufferHead>) {
        let shard = self.shard();
        let mut slots = shard.slots.lock();

        if let Some(i) = slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, bh)))
        {
            slots[0..=i].rotate_right(1);
            return;
        }

        bh.get_ref();
        let evicted = slots[LRU_SLOTS - 1].take();
        slots.rotate_right(1);
        slots[0] = Some(bh.clone());
        drop(slots);

        if let Some(old) = evicted {
            old.put_ref();
        }
    }

    /// Empties every shard, dropping each slot's reference. The broadcast
    /// form of per-CPU LRU invalidation.
    pub(crate) fn evict_all(&self) {
        for shard in self.shards.iter() {
            let drained: Vec<Arc<BufferHead>> = {
                let mut slots = shard.slots.lock();
                slots.iter_mut().filter_map(Option::take).collect()
            };
            for bh in drained {
                bh.put_ref();
            }
        }
    }

    pub(crate) fn stats(&self) -> LruStats {
        let mut out = LruStats::default();
        for shard in self.shards.iter() {
            out.hits += shard.hits.load(Ordering::Relaxed);
            out.misses += shard.misses.load(Ordering::Relaxed);
        }
        out
    }
}
