//! The callbacks a filesystem supplies to the engine.

use std::sync::Arc;

use crate::bh::BufferHead;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::page::Page;
use crate::readwrite;
use crate::writeback::WritebackControl;

/// Maps a logical file block to a device block.
///
/// On success the implementation must point `bh` at the device and block
/// (`set_dev`, `set_block`) and mark it mapped; it may additionally flag the
/// handle `NEW` (freshly allocated, the caller zeroes it), `BOUNDARY` (last
/// block of an extent run), `DELAY`, or `UNWRITTEN`. Leaving the handle
/// unmapped reports a hole.
pub trait BlockMapper: Send + Sync {
    fn map_block(
        &self,
        inode: &Arc<Inode>,
        block: u64,
        bh: &Arc<BufferHead>,
        create: bool,
    ) -> Result<(), CacheError>;
}

/// Page-level policy hooks invoked from writeback and invalidation.
pub trait AddressSpaceOps: Send + Sync {
    /// Reads one page; the page is locked on entry and unlocked by the
    /// completion path.
    fn readpage(&self, inode: &Arc<Inode>, page: &Arc<Page>) -> Result<(), CacheError>;

    /// Writes one page; the page is locked on entry and unlocked before I/O
    /// completes.
    fn writepage(
        &self,
        inode: &Arc<Inode>,
        page: &Arc<Page>,
        wbc: &mut WritebackControl,
    ) -> Result<(), CacheError>;

    /// Throws away page state from `offset` to the end of the page.
    fn invalidatepage(&self, _inode: &Arc<Inode>, page: &Arc<Page>, offset: usize) {
        crate::invalidate::invalidate_page_range(page, offset);
    }
}

/// The stock block-backed implementation: pages are built out of buffer
/// rings via the inode's [`BlockMapper`].
pub struct BlockOps;

impl AddressSpaceOps for BlockOps {
    fn readpage(&self, inode: &Arc<Inode>, page: &Arc<Page>) -> Result<(), CacheError> {
        readwrite::read_full_page(inode, page)
    }

    fn writepage(
        &self,
        inode: &Arc<Inode>,
        page: &Arc<Page>,
        wbc: &mut WritebackControl,
    ) -> Result<(), CacheError> {
        readwrite::write_full_page(inode, page, wbc)
    }
}

/// Superblock-level callbacks.
pub trait SuperOps: Send + Sync {
    /// Persists the inode itself (not its data pages).
    fn write_inode(&self, _inode: &Arc<Inode>, _wbc: &WritebackControl) -> Result<(), CacheError> {
        Ok(())
    }
}

/// For superblocks with no inode metadata of their own.
pub struct NoopSuperOps;

impl SuperOps for NoopSuperOps {}
