//! The dirtiness protocol across handles, pages, mappings, and inodes.
//!
//! Ordering rule: a handle becomes dirty before its page, and the page
//! before the mapping's dirty tag. A concurrent writepage therefore sees
//! either a clean page, or a dirty page whose buffers are already dirty,
//! never a dirty page with only-clean buffers mid-transition.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::bh::{BhState, BufferHead};
use crate::inode::{Inode, InodeState};
use crate::page::{Page, PageFlags};
use crate::writeback;

/// Marks one handle dirty, rippling into page, mapping, and inode state on
/// the clean-to-dirty transition.
pub fn mark_buffer_dirty(bh: &Arc<BufferHead>) {
    if !bh.is_uptodate() {
        warn!(
            block = bh.block(),
            "dirtying a buffer that is not uptodate"
        );
    }

    // Fast path. The fence pairs with the test-and-set below so that a
    // racing setter's page/mapping bookkeeping is visible before we elide
    // our own.
    if bh.is_dirty() {
        fence(Ordering::Acquire);
        if bh.is_dirty() {
            return;
        }
    }

    if !bh.set_bits(BhState::DIRTY) {
        if let Some(page) = bh.page() {
            if !page.set(PageFlags::DIRTY) {
                page_newly_dirty(&page);
            }
        }
    }
}

/// Page-level entry point: every buffer of the page becomes dirty, buffers
/// strictly before the page flag.
pub fn mark_page_dirty(page: &Arc<Page>) {
    let newly = {
        let mapping = page.mapping();
        let _private = mapping.as_ref().map(|m| m.private_lock.lock());
        if let Some(ring) = page.ring_snapshot() {
            for bh in &ring {
                bh.set_bits(BhState::DIRTY);
            }
        }
        !page.set(PageFlags::DIRTY)
    };
    if newly {
        page_newly_dirty(page);
    }
}

/// Bookkeeping for a page's clean-to-dirty transition: dirty tag, mapping
/// and device counters, inode queued for writeback.
fn page_newly_dirty(page: &Arc<Page>) {
    let Some(mapping) = page.mapping() else {
        return;
    };
    mapping.tag_dirty(page.index());
    mapping.add_dirty();
    if let Some(inode) = mapping.owner() {
        if let Some(bdi) = inode.bdi() {
            bdi.add_dirty_page();
        }
        writeback::mark_inode_dirty(&inode, InodeState::DIRTY_PAGES);
    }
}

/// Marks the handle dirty and pins it to `inode`'s associated-buffer list
/// so an fsync of that inode flushes it. The handle belongs to the backing
/// device's mapping, not the inode's.
pub fn mark_buffer_dirty_inode(bh: &Arc<BufferHead>, inode: &Arc<Inode>) {
    mark_buffer_dirty(bh);

    let Some(dev) = bh.dev() else {
        return;
    };
    let backing = dev.mapping().clone();
    let file_mapping = inode.mapping().clone();

    let _private = backing.private_lock.lock();
    match bh.assoc_mapping() {
        Some(current) if Arc::ptr_eq(&current, &file_mapping) => {}
        current => {
            if let Some(old) = current {
                if let Some(old_inode) = old.owner() {
                    let mut list = old_inode.assoc.lock();
                    if remove_by_ptr(&mut list, bh) {
                        bh.put_ref();
                    }
                }
            }
            bh.get_ref();
            inode.assoc.lock().push_back(bh.clone());
            bh.set_assoc_mapping(Some(file_mapping));
        }
    }
}

/// Unlinks the handle from whatever associated list holds it.
pub(crate) fn remove_from_assoc_list(bh: &Arc<BufferHead>) {
    let Some(assoc) = bh.assoc_mapping() else {
        return;
    };
    let backing = bh.dev().map(|d| d.mapping().clone());
    let _private = backing.as_ref().map(|m| m.private_lock.lock());
    if let Some(inode) = assoc.owner() {
        let mut list = inode.assoc.lock();
        if remove_by_ptr(&mut list, bh) {
            bh.put_ref();
        }
    }
    bh.set_assoc_mapping(None);
}

fn remove_by_ptr(
    list: &mut std::collections::VecDeque<Arc<BufferHead>>,
    bh: &Arc<BufferHead>,
) -> bool {
    let before = list.len();
    list.retain(|entry| !Arc::ptr_eq(entry, bh));
    list.len() != before
}

/// Takes the page's dirty flag for writeback: clears flag, tag, and
/// counters. Returns whether the caller now owns a writeout of this page.
pub(crate) fn clear_page_dirty_for_io(page: &Arc<Page>) -> bool {
    if !page.clear(PageFlags::DIRTY) {
        return false;
    }
    if let Some(mapping) = page.mapping() {
        mapping.clear_dirty_tag(page.index());
        mapping.sub_dirty();
        if let Some(bdi) = mapping.owner().and_then(|i| i.bdi()) {
            bdi.sub_dirty_page();
        }
    }
    true
}

/// Puts a page the writer could not process back under dirty accounting.
pub(crate) fn redirty_page(page: &Arc<Page>) {
    if !page.set(PageFlags::DIRTY) {
        page_newly_dirty(page);
    }
}

/// Flags the page as under write I/O and tags it so waiters can find it.
pub(crate) fn set_page_writeback(page: &Arc<Page>) {
    if !page.set(PageFlags::WRITEBACK) {
        if let Some(mapping) = page.mapping() {
            mapping.tag_writeback(page.index());
            if let Some(bdi) = mapping.owner().and_then(|i| i.bdi()) {
                bdi.add_writeback();
            }
        }
    }
}

/// Ends write I/O on the page and wakes anyone sleeping on it.
pub(crate) fn end_page_writeback(page: &Arc<Page>) {
    if page.clear(PageFlags::WRITEBACK) {
        if let Some(mapping) = page.mapping() {
            mapping.clear_writeback_tag(page.index());
            if let Some(bdi) = mapping.owner().and_then(|i| i.bdi()) {
                bdi.sub_writeback();
            }
        }
        page.wake_writeback_waiters();
    }
}
