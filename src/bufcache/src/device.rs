//! A cached block device: the disk plus the mapping that owns its page
//! cache. The mapping hangs off a pseudo-inode so device pages ride the
//! same dirty/writeback machinery as file pages; its block mapper is the
//! identity.

use std::sync::{Arc, Weak};

use blockio::Disk;
use once_cell::sync::OnceCell;

use crate::bh::BufferHead;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::mapping::Mapping;
use crate::ops::BlockMapper;
use crate::writeback::BackingDev;

pub struct BlockDev {
    id: u64,
    disk: Arc<Disk>,
    bdi: Arc<BackingDev>,
    inode: OnceCell<Arc<Inode>>,
}

impl BlockDev {
    pub(crate) fn new(id: u64, disk: Arc<Disk>, bdi: Arc<BackingDev>) -> Arc<Self> {
        Arc::new(Self {
            id,
            disk,
            bdi,
            inode: OnceCell::new(),
        })
    }

    pub(crate) fn install_inode(&self, inode: Arc<Inode>) {
        self.inode
            .set(inode)
            .unwrap_or_else(|_| unreachable!("device inode installed twice"));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub fn sector_size(&self) -> u32 {
        self.disk.sector_size()
    }

    pub fn bdi(&self) -> &Arc<BackingDev> {
        &self.bdi
    }

    /// The pseudo-inode owning the device page cache.
    pub fn inode(&self) -> &Arc<Inode> {
        self.inode.get().expect("device inode not installed")
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        self.inode().mapping()
    }

    /// Default block size for handle lookups on this device.
    pub fn block_size(&self) -> usize {
        self.mapping().block_size()
    }

    pub fn set_block_size(&self, size: usize) -> Result<(), CacheError> {
        crate::cache::check_block_size(self, self.mapping().page_size(), size)?;
        self.mapping().set_block_size(size);
        Ok(())
    }
}

impl std::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDev")
            .field("id", &self.id)
            .field("disk", &self.disk.name())
            .finish()
    }
}

/// Block mapper for the device mapping itself: logical block N is device
/// block N, bounded by the disk.
pub(crate) struct IdentityMapper {
    pub(crate) dev: Weak<BlockDev>,
}

impl BlockMapper for IdentityMapper {
    fn map_block(
        &self,
        _inode: &Arc<Inode>,
        block: u64,
        bh: &Arc<BufferHead>,
        _create: bool,
    ) -> Result<(), CacheError> {
        let Some(dev) = self.dev.upgrade() else {
            return Err(CacheError::Stale);
        };
        let end = (block + 1).checked_mul(bh.size() as u64);
        if end.is_none() || end.unwrap() > dev.disk().size() {
            return Err(CacheError::Io);
        }
        bh.set_dev(Some(dev));
        bh.set_block(block);
        bh.set_mapped();
        Ok(())
    }
}
