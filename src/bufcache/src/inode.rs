//! Inodes as the writeback engine sees them: a state word, a mapping, the
//! dirtied-when stamp that drives expiry and the livelock bound, and the
//! associated-buffer list an fsync of this inode must flush.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::bh::BufferHead;
use crate::device::BlockDev;
use crate::mapping::Mapping;
use crate::ops::{AddressSpaceOps, BlockMapper};
use crate::superblock::SuperBlock;
use crate::writeback::BackingDev;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct InodeState: u64 {
        /// The inode itself must reach the filesystem's `write_inode`.
        const DIRTY_SYNC = 1 << 0;
        /// Like `DIRTY_SYNC` but data-integrity relevant (fdatasync).
        const DIRTY_DATASYNC = 1 << 1;
        /// The mapping has dirty pages.
        const DIRTY_PAGES = 1 << 2;
        /// Under writeback; sleep-waitable.
        const SYNC = 1 << 3;
        const NEW = 1 << 4;
        const WILL_FREE = 1 << 5;
        const FREEING = 1 << 6;
        const CLEAR = 1 << 7;
    }
}

impl InodeState {
    pub const DIRTY_ALL: InodeState = InodeState::DIRTY_SYNC
        .union(InodeState::DIRTY_DATASYNC)
        .union(InodeState::DIRTY_PAGES);
}

/// Which writeback list the inode currently sits on. Maintained under the
/// owning `BackingDev`'s list lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WbList {
    None = 0,
    Dirty = 1,
    Io = 2,
    MoreIo = 3,
}

pub struct Inode {
    ino: u64,
    state: AtomicU64,
    /// Serializes compound state transitions (snapshot dirty bits, set
    /// `SYNC`, requeue decisions). Individual bit reads stay lock-free.
    pub(crate) state_lock: Mutex<()>,
    size: AtomicU64,
    pub(crate) dirtied_when: AtomicU64,
    on_list: AtomicU8,
    mapping: Arc<Mapping>,
    mapper: Arc<dyn BlockMapper>,
    ops: Arc<dyn AddressSpaceOps>,
    sb: Weak<SuperBlock>,
    dev: Weak<BlockDev>,
    bdi: Weak<BackingDev>,
    pub(crate) assoc: Mutex<VecDeque<Arc<BufferHead>>>,
}

impl Inode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ino: u64,
        size: u64,
        mapping: Arc<Mapping>,
        mapper: Arc<dyn BlockMapper>,
        ops: Arc<dyn AddressSpaceOps>,
        sb: Weak<SuperBlock>,
        dev: Weak<BlockDev>,
        bdi: Weak<BackingDev>,
    ) -> Arc<Self> {
        let inode = Arc::new(Self {
            ino,
            state: AtomicU64::new(0),
            state_lock: Mutex::new(()),
            size: AtomicU64::new(size),
            dirtied_when: AtomicU64::new(0),
            on_list: AtomicU8::new(WbList::None as u8),
            mapping: mapping.clone(),
            mapper,
            ops,
            sb,
            dev,
            bdi,
            assoc: Mutex::new(VecDeque::new()),
        });
        mapping.set_owner(Arc::downgrade(&inode));
        inode
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// The caller holds whatever higher-level lock orders size updates; the
    /// engine only reads it.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    pub fn mapper(&self) -> &Arc<dyn BlockMapper> {
        &self.mapper
    }

    pub(crate) fn ops(&self) -> &Arc<dyn AddressSpaceOps> {
        &self.ops
    }

    pub fn sb(&self) -> Option<Arc<SuperBlock>> {
        self.sb.upgrade()
    }

    pub fn dev(&self) -> Option<Arc<BlockDev>> {
        self.dev.upgrade()
    }

    pub(crate) fn bdi(&self) -> Option<Arc<BackingDev>> {
        self.bdi.upgrade()
    }

    // --- state bits ---

    pub fn state(&self) -> InodeState {
        InodeState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    pub fn is(&self, mask: InodeState) -> bool {
        self.state.load(Ordering::Acquire) & mask.bits() != 0
    }

    pub(crate) fn set_state(&self, mask: InodeState) -> InodeState {
        InodeState::from_bits_retain(self.state.fetch_or(mask.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear_state(&self, mask: InodeState) -> InodeState {
        InodeState::from_bits_retain(self.state.fetch_and(!mask.bits(), Ordering::AcqRel))
    }

    pub fn is_dirty(&self) -> bool {
        self.is(InodeState::DIRTY_ALL)
    }

    /// Sleeps until a concurrent writeback of this inode drops `SYNC`.
    pub(crate) fn wait_sync(&self) {
        let dev = self.dev();
        bitwait::wait_on_bit_with(&self.state, InodeState::SYNC.bits(), || {
            if let Some(dev) = &dev {
                dev.disk().kick();
            }
        });
    }

    pub(crate) fn wake_sync_waiters(&self) {
        bitwait::wake_bit(&self.state, InodeState::SYNC.bits());
    }

    // --- writeback list membership ---

    pub(crate) fn wb_list(&self) -> WbList {
        match self.on_list.load(Ordering::Acquire) {
            1 => WbList::Dirty,
            2 => WbList::Io,
            3 => WbList::MoreIo,
            _ => WbList::None,
        }
    }

    pub(crate) fn set_wb_list(&self, list: WbList) {
        self.on_list.store(list as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}
