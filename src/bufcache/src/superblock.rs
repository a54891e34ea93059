//! Superblocks: the filesystem-level container writeback scopes and pins.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::CacheConfig;
use crate::device::BlockDev;
use crate::inode::{Inode, InodeState};
use crate::mapping::Mapping;
use crate::ops::{AddressSpaceOps, BlockMapper, BlockOps, SuperOps};
use crate::writeback::BackingDev;

pub struct SuperBlock {
    name: String,
    dev: Option<Arc<BlockDev>>,
    bdi: Option<Arc<BackingDev>>,
    ops: Arc<dyn SuperOps>,
    config: Arc<CacheConfig>,
    inodes: Mutex<Vec<Arc<Inode>>>,
    /// Writeback takes the read side before touching inodes of this
    /// superblock so an unmount cannot rip it out from under the worker.
    pub(crate) umount: RwLock<()>,
}

impl SuperBlock {
    pub(crate) fn new(
        name: String,
        dev: Option<Arc<BlockDev>>,
        bdi: Option<Arc<BackingDev>>,
        ops: Arc<dyn SuperOps>,
        config: Arc<CacheConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            dev,
            bdi,
            ops,
            config,
            inodes: Mutex::new(Vec::new()),
            umount: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev(&self) -> Option<&Arc<BlockDev>> {
        self.dev.as_ref()
    }

    pub fn bdi(&self) -> Option<&Arc<BackingDev>> {
        self.bdi.as_ref()
    }

    pub(crate) fn ops(&self) -> &Arc<dyn SuperOps> {
        &self.ops
    }

    /// Creates an inode whose pages are block-backed through `mapper`.
    pub fn create_inode(
        self: &Arc<Self>,
        ino: u64,
        size: u64,
        block_size: usize,
        mapper: Arc<dyn BlockMapper>,
    ) -> Arc<Inode> {
        self.create_inode_with_ops(ino, size, block_size, mapper, Arc::new(BlockOps))
    }

    pub fn create_inode_with_ops(
        self: &Arc<Self>,
        ino: u64,
        size: u64,
        block_size: usize,
        mapper: Arc<dyn BlockMapper>,
        ops: Arc<dyn AddressSpaceOps>,
    ) -> Arc<Inode> {
        let mapping = Arc::new(Mapping::new(self.config.page_size, block_size));
        let inode = Inode::new(
            ino,
            size,
            mapping,
            mapper,
            ops,
            Arc::downgrade(self),
            self.dev
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
            self.bdi
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
        );
        self.inodes.lock().push(inode.clone());
        inode
    }

    pub(crate) fn adopt_inode(&self, inode: Arc<Inode>) {
        self.inodes.lock().push(inode);
    }

    pub fn inodes(&self) -> Vec<Arc<Inode>> {
        self.inodes.lock().clone()
    }

    /// Drops an inode from the superblock. Fails while the inode still has
    /// dirty state.
    pub fn evict_inode(&self, inode: &Arc<Inode>) -> bool {
        if inode.is_dirty() || !crate::fsync::remove_inode_buffers(inode) {
            return false;
        }
        inode.set_state(InodeState::FREEING);
        let mut inodes = self.inodes.lock();
        inodes.retain(|i| !Arc::ptr_eq(i, inode));
        inode.set_state(InodeState::CLEAR);
        true
    }

    /// Opportunistic pin: `None` when an unmount holds the write side.
    pub(crate) fn pin(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.umount.try_read()
    }
}

impl std::fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBlock")
            .field("name", &self.name)
            .field("inodes", &self.inodes.lock().len())
            .finish()
    }
}
