//! Block-buffer cache and writeback engine.
//!
//! Mediates between an in-memory page cache and a block device: named,
//! reference-counted handles to individual device blocks ([`BufferRef`]),
//! dirty-state tracking across handles, pages, inodes, and superblocks,
//! per-device writeback workers for asynchronous batched writeout, and
//! synchronous flush entry points for data integrity.
//!
//! The cast:
//!
//! - [`BufferCache`]: the engine, device registration, handle lookup and
//!   creation backed by sharded lookaside arrays and per-device page trees.
//! - [`Page`] / [`BufferHead`]: a page and the ring of block handles
//!   tiling it; state lives in atomic bit words, with sleepable lock bits.
//! - [`Inode`] / [`SuperBlock`]: the writeback-visible shape of the
//!   filesystem above; filesystems plug in via [`BlockMapper`],
//!   [`AddressSpaceOps`], and [`SuperOps`].
//! - [`BackingDev`]: per-device writeback state and its worker thread;
//!   [`sync_writeback`] and friends are the flush API.
//!
//! The block device below is anything `blockio` can drive.

mod bh;
mod bulkio;
mod cache;
mod clock;
mod config;
mod device;
mod dirty;
mod error;
mod fsync;
mod inode;
mod invalidate;
mod io;
mod lru;
mod mapping;
mod ops;
mod page;
mod readwrite;
mod superblock;
#[cfg(test)]
mod testutil;
mod writeback;

pub use bh::{attach_buffers_to_page, try_release_page, BhState, BufferHead, BufferRef, EndIo};
pub use bulkio::{read_pages, write_pages};
pub use cache::BufferCache;
pub use config::{CacheConfig, GrowPolicy, ReclaimHook, WritebackConfig};
pub use device::BlockDev;
pub use dirty::{mark_buffer_dirty, mark_buffer_dirty_inode, mark_page_dirty};
pub use error::CacheError;
pub use fsync::{fsync_associated, remove_inode_buffers};
pub use inode::{Inode, InodeState};
pub use invalidate::invalidate_page_range;
pub use io::{forget_buffer, sync_buffer};
pub use lru::LruStats;
pub use mapping::Mapping;
pub use ops::{AddressSpaceOps, BlockMapper, BlockOps, NoopSuperOps, SuperOps};
pub use page::{Page, PageFlags};
pub use readwrite::{
    commit_partial_write, prepare_partial_write, read_full_page, truncate_page, write_full_page,
};
pub use superblock::SuperBlock;
pub use writeback::{
    mark_inode_dirty, start_writeback, sync_inode, sync_superblock, sync_writeback,
    wakeup_flushers, writeback_inodes_sb, writeback_inodes_sb_if_idle, BackingDev, SyncMode,
    WritebackControl,
};
