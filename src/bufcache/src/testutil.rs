//! Shared fixtures for the in-crate tests: a cache over a RAM disk, and a
//! table-driven block mapper standing in for a filesystem.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blockio::{Disk, DiskOptions, MemBackend};
use parking_lot::Mutex;

use crate::bh::BufferHead;
use crate::cache::BufferCache;
use crate::config::CacheConfig;
use crate::device::BlockDev;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::ops::{BlockMapper, NoopSuperOps};
use crate::superblock::SuperBlock;

pub(crate) struct Rig {
    pub cache: Arc<BufferCache>,
    pub backend: Arc<MemBackend>,
    pub disk: Arc<Disk>,
    pub dev: Arc<BlockDev>,
}

pub(crate) fn rig(nsectors: u64, block_size: usize, workers: usize) -> Rig {
    rig_with(CacheConfig::default(), nsectors, block_size, workers)
}

pub(crate) fn rig_with(
    config: CacheConfig,
    nsectors: u64,
    block_size: usize,
    workers: usize,
) -> Rig {
    let backend = Arc::new(MemBackend::new(nsectors * 512));
    let disk = Disk::new(
        "t",
        backend.clone(),
        DiskOptions {
            sector_size: 512,
            workers,
        },
    )
    .unwrap();
    let cache = BufferCache::new(config);
    let dev = cache.add_device(disk.clone(), block_size).unwrap();
    Rig {
        cache,
        backend,
        disk,
        dev,
    }
}

/// Polls `cond` until it holds or the deadline passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A filesystem in a HashMap: logical blocks map to device blocks through
/// a table, `create` allocates from a bump counter and reports `NEW`.
pub(crate) struct TestMapper {
    dev: Weak<BlockDev>,
    table: Mutex<HashMap<u64, u64>>,
    boundaries: Mutex<HashSet<u64>>,
    next_free: AtomicU64,
    fail_create: Mutex<Option<u64>>,
}

impl TestMapper {
    pub(crate) fn new(dev: &Arc<BlockDev>, first_free_block: u64) -> Arc<Self> {
        Arc::new(Self {
            dev: Arc::downgrade(dev),
            table: Mutex::new(HashMap::new()),
            boundaries: Mutex::new(HashSet::new()),
            next_free: AtomicU64::new(first_free_block),
            fail_create: Mutex::new(None),
        })
    }

    /// Pre-establishes `file_block -> device_block`.
    pub(crate) fn map_direct(&self, file_block: u64, device_block: u64) {
        self.table.lock().insert(file_block, device_block);
    }

    /// Flags a file block as an extent boundary.
    pub(crate) fn set_boundary(&self, file_block: u64) {
        self.boundaries.lock().insert(file_block);
    }

    /// Makes allocation of the given file block fail with `NoSpace`.
    pub(crate) fn fail_create_of(&self, file_block: u64) {
        *self.fail_create.lock() = Some(file_block);
    }

    pub(crate) fn device_block_of(&self, file_block: u64) -> Option<u64> {
        self.table.lock().get(&file_block).copied()
    }
}

impl BlockMapper for TestMapper {
    fn map_block(
        &self,
        _inode: &Arc<Inode>,
        block: u64,
        bh: &Arc<BufferHead>,
        create: bool,
    ) -> Result<(), CacheError> {
        let Some(dev) = self.dev.upgrade() else {
            return Err(CacheError::Stale);
        };
        let existing = self.table.lock().get(&block).copied();
        match existing {
            Some(phys) => {
                bh.set_dev(Some(dev));
                bh.set_block(phys);
                bh.set_mapped();
                if self.boundaries.lock().contains(&block) {
                    bh.set_boundary();
                }
            }
            None if create => {
                if *self.fail_create.lock() == Some(block) {
                    return Err(CacheError::NoSpace);
                }
                let phys = self.next_free.fetch_add(1, Ordering::Relaxed);
                self.table.lock().insert(block, phys);
                bh.set_dev(Some(dev));
                bh.set_block(phys);
                bh.set_mapped();
                bh.set_new();
            }
            None => {}
        }
        Ok(())
    }
}

pub(crate) struct FileRig {
    pub rig: Rig,
    pub sb: Arc<SuperBlock>,
    pub inode: Arc<Inode>,
    pub mapper: Arc<TestMapper>,
}

/// A rig plus one mounted superblock and one regular file inode of
/// `size` bytes, mapped through a [`TestMapper`] whose allocations start
/// past the device blocks the test wants for itself.
pub(crate) fn file_rig(
    config: CacheConfig,
    nsectors: u64,
    block_size: usize,
    size: u64,
    first_free_block: u64,
) -> FileRig {
    let rig = rig_with(config, nsectors, block_size, 1);
    let sb = rig.cache.mount("testfs", &rig.dev, Arc::new(NoopSuperOps));
    let mapper = TestMapper::new(&rig.dev, first_free_block);
    let inode = sb.create_inode(2, size, block_size, mapper.clone());
    FileRig {
        rig,
        sb,
        inode,
        mapper,
    }
}
