//! The engine object: device registration, handle lookup and creation.
//!
//! Lookup goes lookaside shard first, then the device's page cache: compute
//! the page index covering the block, walk that page's ring under the
//! mapping's private lock. Creation (`grow`) builds the page and its ring on
//! demand and cannot fail for valid inputs: when the target page's existing
//! ring is pinned it backs off through the reclaim hook and retries,
//! bounded only if the grow policy says so.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockio::Disk;
use tracing::{debug, warn};

use crate::bh::{self, BhState, BufferHead, BufferRef};
use crate::config::CacheConfig;
use crate::device::{BlockDev, IdentityMapper};
use crate::error::CacheError;
use crate::inode::Inode;
use crate::lru::{LruSet, LruStats};
use crate::mapping::Mapping;
use crate::ops::{BlockOps, NoopSuperOps, SuperOps};
use crate::page::Page;
use crate::superblock::SuperBlock;
use crate::writeback::{self, BackingDev};

pub struct BufferCache {
    config: Arc<CacheConfig>,
    lru: LruSet,
    /// Home of the per-device pseudo-inodes, so device pages ride the same
    /// writeback lists as file pages.
    bdev_sb: Arc<SuperBlock>,
    next_dev_id: AtomicU64,
}

impl BufferCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let bdev_sb = SuperBlock::new(
            "bdev".to_string(),
            None,
            None,
            Arc::new(NoopSuperOps),
            config.clone(),
        );
        Arc::new(Self {
            lru: LruSet::new(config.lru_shards),
            bdev_sb,
            next_dev_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn lru_stats(&self) -> LruStats {
        self.lru.stats()
    }

    /// Brings a disk under the cache with the given default block size.
    pub fn add_device(
        &self,
        disk: Arc<Disk>,
        block_size: usize,
    ) -> Result<Arc<BlockDev>, CacheError> {
        let id = self.next_dev_id.fetch_add(1, Ordering::Relaxed);
        let bdi = BackingDev::new(format!("{}-wb", disk.name()), self.config.clone());
        let dev = BlockDev::new(id, disk.clone(), bdi.clone());
        check_block_size(&dev, self.config.page_size, block_size)?;

        let mapping = Arc::new(Mapping::new(self.config.page_size, block_size));
        let inode = Inode::new(
            id,
            disk.size(),
            mapping,
            Arc::new(IdentityMapper {
                dev: Arc::downgrade(&dev),
            }),
            Arc::new(BlockOps),
            Arc::downgrade(&self.bdev_sb),
            Arc::downgrade(&dev),
            Arc::downgrade(&bdi),
        );
        dev.install_inode(inode.clone());
        self.bdev_sb.adopt_inode(inode);
        writeback::register_bdi(&bdi);
        debug!(dev = id, disk = disk.name(), block_size, "device added");
        Ok(dev)
    }

    /// Creates a filesystem superblock over a cached device.
    pub fn mount(
        &self,
        name: impl Into<String>,
        dev: &Arc<BlockDev>,
        ops: Arc<dyn SuperOps>,
    ) -> Arc<SuperBlock> {
        SuperBlock::new(
            name.into(),
            Some(dev.clone()),
            Some(dev.bdi().clone()),
            ops,
            self.config.clone(),
        )
    }

    /// Looks up `(dev, block, size)`, taking a reference on the hit.
    pub fn find(&self, dev: &Arc<BlockDev>, block: u64, size: usize) -> Option<BufferRef> {
        if let Some(bh) = self.lru.lookup(dev, block, size) {
            return Some(BufferRef::adopt(bh));
        }
        let bh = find_buffer_in_pages(dev, block, size)?;
        self.lru.install(&bh);
        Some(BufferRef::adopt(bh))
    }

    /// Looks up or creates the handle. Cannot fail for a valid size except
    /// under a bounded grow policy.
    pub fn get_or_create(
        &self,
        dev: &Arc<BlockDev>,
        block: u64,
        size: usize,
    ) -> Result<BufferRef, CacheError> {
        check_block_size(dev, self.config.page_size, size)?;
        let mut tries = 0u32;
        loop {
            if let Some(bh) = self.find(dev, block, size) {
                return Ok(bh);
            }
            if let Some(bh) = self.grow(dev, block, size)? {
                return Ok(bh);
            }
            // The covering page's ring is pinned with a different block
            // size. Push for reclaim and retry.
            self.config.reclaim.free_more_memory();
            if let Some(max) = self.config.grow.max_retries {
                tries += 1;
                if tries > max {
                    return Err(CacheError::OutOfMemory);
                }
            }
        }
    }

    /// As [`get_or_create`](Self::get_or_create), additionally reading the
    /// block in if it is not already uptodate.
    pub fn read(
        &self,
        dev: &Arc<BlockDev>,
        block: u64,
        size: usize,
    ) -> Result<BufferRef, CacheError> {
        let bh = self.get_or_create(dev, block, size)?;
        if !bh.is_uptodate() {
            crate::io::read_buffer_sync(bh.inner())?;
        }
        Ok(bh)
    }

    /// Flushes every lookaside shard, then drops this device's clean pages.
    /// Dirty and in-use pages survive.
    pub fn invalidate_device(&self, dev: &Arc<BlockDev>) {
        self.lru.evict_all();
        crate::invalidate::invalidate_clean_pages(dev.mapping());
    }

    /// Builds the page at the block's index and attaches a ring covering
    /// `(dev, block, size)`. `Ok(None)` means the existing ring is pinned
    /// and the caller should retry.
    fn grow(
        &self,
        dev: &Arc<BlockDev>,
        block: u64,
        size: usize,
    ) -> Result<Option<BufferRef>, CacheError> {
        let mapping = dev.mapping().clone();
        let sizebits = mapping.size_bits(size);
        let index = block >> sizebits;
        let first_block = index << sizebits;

        let page = mapping.find_or_create_page(index);

        if page.has_buffers() {
            let same_size = page
                .first_buffer()
                .is_some_and(|bh| bh.size() == size);
            if same_size {
                let bh = {
                    let _private = mapping.private_lock.lock();
                    init_ring(dev, &page, first_block);
                    pick_from_ring(&page, block, first_block)
                };
                page.unlock();
                return Ok(Some(BufferRef::adopt(bh)));
            }
            let released = {
                let _private = mapping.private_lock.lock();
                bh::try_release(&page)
            };
            if released.is_err() {
                page.unlock();
                return Ok(None);
            }
        }

        {
            let _private = mapping.private_lock.lock();
            bh::attach_ring(&page, size, BhState::empty());
            init_ring(dev, &page, first_block);
        }
        let bh = pick_from_ring(&page, block, first_block);
        page.unlock();
        Ok(Some(BufferRef::adopt(bh)))
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Points every unmapped handle of the ring at consecutive device blocks
/// starting at `first_block`, propagating page uptodateness.
fn init_ring(dev: &Arc<BlockDev>, page: &Arc<Page>, first_block: u64) {
    let guard = page.buffers_lock();
    let Some(ring) = guard.as_ref() else { return };
    let uptodate = page.is_uptodate();
    for (i, bh) in ring.iter().enumerate() {
        if !bh.is_mapped() {
            bh.set_dev(Some(dev.clone()));
            bh.set_block(first_block + i as u64);
            bh.set_mapped();
            if uptodate {
                bh.set_uptodate();
            }
        }
    }
}

fn pick_from_ring(page: &Arc<Page>, block: u64, first_block: u64) -> Arc<BufferHead> {
    let guard = page.buffers_lock();
    let ring = guard.as_ref().expect("ring vanished under the page lock");
    let bh = ring[(block - first_block) as usize].clone();
    bh.get_ref();
    bh
}

/// Page-cache half of lookup: walk the covering page's ring. Takes a
/// reference on the match. A non-matching ring with unmapped entries is the
/// expected grow race and misses silently.
pub(crate) fn find_buffer_in_pages(
    dev: &Arc<BlockDev>,
    block: u64,
    size: usize,
) -> Option<Arc<BufferHead>> {
    let mapping = dev.mapping();
    let index = block >> mapping.size_bits(size);
    let page = mapping.page_at(index)?;

    let _private = mapping.private_lock.lock();
    let guard = page.buffers_lock();
    let ring = guard.as_ref()?;

    let mut all_mapped = true;
    for bh in ring {
        if bh.is_mapped() && bh.block() == block && bh.size() == size {
            bh.get_ref();
            bh.touch();
            return Some(bh.clone());
        }
        if !bh.is_mapped() {
            all_mapped = false;
        }
    }
    if all_mapped {
        warn!(
            dev = dev.id(),
            block,
            size,
            ring_first = ring.first().map(|b| b.block()).unwrap_or(0),
            "block not found in a fully mapped ring"
        );
    }
    None
}

pub(crate) fn check_block_size(
    dev: &BlockDev,
    page_size: usize,
    size: usize,
) -> Result<(), CacheError> {
    let sector = dev.sector_size() as usize;
    if !size.is_power_of_two() || size < 512 || size > page_size || size % sector != 0 {
        return Err(CacheError::InvalidBlockSize(size));
    }
    Ok(())
}
