//! Throwing cached state away: per-page range invalidation and whole-device
//! invalidation.

use std::sync::Arc;

use tracing::debug;

use crate::bh::{self, BhState, BufferHead};
use crate::mapping::Mapping;
use crate::page::Page;

/// Discards every buffer of a locked page whose region extends past
/// `offset`. At offset zero the ring is additionally released if nothing
/// pins it.
pub fn invalidate_page_range(page: &Arc<Page>, offset: usize) {
    debug_assert!(page.is_locked(), "invalidating an unlocked page");
    let Some(ring) = page.ring_snapshot() else {
        return;
    };
    for bh in &ring {
        if bh.offset_in_page() + bh.size() > offset {
            discard_buffer(bh);
        }
    }
    if offset == 0 {
        if let Some(mapping) = page.mapping() {
            let _private = mapping.private_lock.lock();
            // Best effort; a pinned ring stays until its holders let go.
            let _ = bh::try_release(page);
        }
    }
}

/// Strips a buffer of everything that ties it to disk state.
fn discard_buffer(bh: &Arc<BufferHead>) {
    bh.lock();
    bh.clear_bits(
        BhState::DIRTY
            | BhState::MAPPED
            | BhState::REQ
            | BhState::NEW
            | BhState::DELAY
            | BhState::UNWRITTEN,
    );
    bh.set_dev(None);
    bh.unlock();
}

/// Drops every clean, unpinned page of the mapping. Dirty pages, pages
/// under writeback, and pages with held buffers survive untouched.
pub(crate) fn invalidate_clean_pages(mapping: &Arc<Mapping>) {
    let mut dropped = 0usize;
    for page in mapping.pages_snapshot() {
        if !page.try_lock() {
            continue;
        }
        if !page.is_dirty() && !page.is_writeback() {
            let released = {
                let _private = mapping.private_lock.lock();
                bh::try_release(&page)
            };
            if released.is_ok() {
                mapping.remove_page(&page);
                dropped += 1;
            }
        }
        page.unlock();
    }
    debug!(dropped, "invalidated clean pages");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::mark_buffer_dirty;
    use crate::testutil::rig;

    #[test]
    fn device_invalidation_keeps_dirty_pages() {
        let rig = rig(64, 1024, 1);

        // Page 0 clean and valid, page 1 holds a dirty block.
        let clean = rig.cache.read(&rig.dev, 0, 1024).unwrap();
        let dirty = rig.cache.read(&rig.dev, 5, 1024).unwrap();
        mark_buffer_dirty(dirty.inner());
        drop(clean);
        drop(dirty);

        rig.cache.invalidate_device(&rig.dev);

        let mapping = rig.dev.mapping();
        assert!(mapping.page_at(0).is_none(), "clean page must be dropped");
        let kept = mapping.page_at(1).expect("dirty page must survive");
        assert!(kept.is_dirty());

        assert!(rig.cache.find(&rig.dev, 0, 1024).is_none());
        let refound = rig.cache.find(&rig.dev, 5, 1024).expect("dirty block");
        assert!(refound.is_dirty());
    }

    #[test]
    fn held_pages_survive_invalidation() {
        let rig = rig(64, 1024, 1);
        let held = rig.cache.read(&rig.dev, 2, 1024).unwrap();

        rig.cache.invalidate_device(&rig.dev);
        // The caller's reference pinned the ring; nothing was lost.
        assert!(rig.dev.mapping().page_at(0).is_some());
        assert!(held.is_uptodate());
    }

    #[test]
    fn range_invalidation_discards_only_the_tail() {
        let rig = rig(64, 1024, 1);
        let bh = rig.cache.read(&rig.dev, 1, 1024).unwrap();
        let page = bh.page().unwrap();
        let ring = page.ring_snapshot().unwrap();
        for sibling in &ring {
            sibling.set_uptodate();
        }
        mark_buffer_dirty(&ring[3]);

        page.lock();
        invalidate_page_range(&page, 2048);
        page.unlock();

        assert!(ring[0].is_mapped() && ring[1].is_mapped());
        assert!(!ring[2].is_mapped() && !ring[3].is_mapped());
        assert!(!ring[3].is_dirty(), "discarded buffer loses dirtiness");
        assert!(ring[2].dev().is_none());
        assert!(page.has_buffers(), "partial invalidation keeps the ring");
    }

    #[test]
    fn full_invalidation_releases_an_unpinned_ring() {
        let rig = rig(64, 1024, 1);
        let bh = rig.cache.read(&rig.dev, 1, 1024).unwrap();
        let page = bh.page().unwrap();
        drop(bh);

        page.lock();
        invalidate_page_range(&page, 0);
        page.unlock();
        assert!(!page.has_buffers());
    }
}
