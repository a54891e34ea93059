//! Building full pages out of blocks: the read driver, the write driver,
//! and partial-write prepare/commit.
//!
//! Async completion coalescing: several handles of one page finish I/O on
//! device threads in arbitrary order, but the page must flip state exactly
//! once, after the last sibling. Every completer takes the spinning
//! `UPTODATE_LOCK` bit on the page's *first* handle, clears its own async
//! bit inside the section, and walks the siblings; only the completer that
//! sees no async bit left performs the page transition. Clearing before
//! unlocking and walking after locking is what makes the "am I last?" test
//! sound.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::bh::{self, BhState, BufferHead};
use crate::dirty;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::io;
use crate::page::{Page, RingSnapshot};
use crate::writeback::WritebackControl;

fn end_io(f: fn(&Arc<BufferHead>, bool)) -> crate::bh::EndIo {
    Arc::new(f)
}

// === Read path === //

/// Reads every not-uptodate block of a locked page, unlocking the page when
/// the last block completes (possibly before this returns).
pub fn read_full_page(inode: &Arc<Inode>, page: &Arc<Page>) -> Result<(), CacheError> {
    assert!(page.is_locked(), "reading an unlocked page");

    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    if !page.has_buffers() {
        bh::attach_ring(page, block_size, BhState::empty());
    }
    let ring = page.ring_snapshot().expect("ring just attached");

    let block_bits = block_size.trailing_zeros();
    // First block past the file; everything from here is a hole.
    let blocks_in_file = (inode.size() + block_size as u64 - 1) >> block_bits;
    let mut iblock = page.index() << mapping.size_bits(block_size);

    let mut to_read: RingSnapshot = SmallVec::new();
    let mut fully_mapped = true;

    for bh in &ring {
        if bh.is_uptodate() {
            iblock += 1;
            continue;
        }
        if !bh.is_mapped() {
            let mut map_err = false;
            if iblock < blocks_in_file {
                if let Err(e) = inode.mapper().map_block(inode, iblock, bh, false) {
                    page.set_error();
                    mapping.set_error(e);
                    map_err = true;
                }
            }
            if !bh.is_mapped() {
                fully_mapped = false;
                page.zero_range(bh.offset_in_page(), bh.offset_in_page() + bh.size());
                if !map_err {
                    bh.set_uptodate();
                }
                iblock += 1;
                continue;
            }
            // The mapper may have pulled the block uptodate itself.
            if bh.is_uptodate() {
                iblock += 1;
                continue;
            }
        }
        to_read.push(bh.clone());
        iblock += 1;
    }

    if fully_mapped {
        page.set_mapped_to_disk();
    }

    if to_read.is_empty() {
        // All holes or already valid.
        if !page.is_error() {
            page.set_uptodate();
        }
        page.unlock();
        return Ok(());
    }

    // Stage two: stage every read before submitting any, so the completion
    // walk never sees a sibling it could mistake for finished.
    for bh in &to_read {
        bh.lock();
        bh.set_end_io(end_io(end_buffer_async_read));
        bh.set_bits(BhState::ASYNC_READ);
    }

    // Stage three: submit, rechecking under the lock; another reader may
    // have beaten us to a block.
    for bh in &to_read {
        if bh.is_uptodate() {
            io::complete_local(bh, true);
        } else {
            io::submit_read(bh);
        }
    }
    if let Some(dev) = inode.dev() {
        dev.disk().kick();
    }
    Ok(())
}

/// Read completion for one handle; the last sibling marks the page and
/// unlocks it.
pub(crate) fn end_buffer_async_read(bh: &Arc<BufferHead>, ok: bool) {
    let Some(page) = bh.page() else {
        return;
    };
    if ok {
        bh.set_uptodate();
    } else {
        bh.clear_uptodate();
        io::buffer_io_error(bh);
        page.set_error();
    }

    let ring = page.ring_snapshot().expect("completion on a page without a ring");
    let first = ring[0].clone();
    let mut page_uptodate = true;
    {
        let _coalesce = bitwait::bit_spin_lock(&first.state, BhState::UPTODATE_LOCK.bits());
        bh.clear_bits(BhState::ASYNC_READ);
        bh.unlock();
        for sibling in &ring {
            if !sibling.is_uptodate() {
                page_uptodate = false;
            }
            if sibling.is(BhState::ASYNC_READ) {
                // Someone is still in flight; they will finish the page.
                return;
            }
        }
    }

    if page_uptodate && !page.is_error() {
        page.set_uptodate();
    }
    page.unlock();
}

/// Write completion for one handle; the last sibling ends page writeback.
pub(crate) fn end_buffer_async_write(bh: &Arc<BufferHead>, ok: bool) {
    let Some(page) = bh.page() else {
        return;
    };
    if !ok {
        io::buffer_io_error(bh);
        bh.set_bits(BhState::WRITE_IO_ERROR);
        if let Some(mapping) = page.mapping() {
            mapping.set_error(CacheError::Io);
        }
        page.set_error();
    }

    let ring = page.ring_snapshot().expect("completion on a page without a ring");
    let first = ring[0].clone();
    {
        let _coalesce = bitwait::bit_spin_lock(&first.state, BhState::UPTODATE_LOCK.bits());
        bh.clear_bits(BhState::ASYNC_WRITE);
        bh.unlock();
        for sibling in &ring {
            if sibling.is(BhState::ASYNC_WRITE) {
                return;
            }
        }
    }
    dirty::end_page_writeback(&page);
}

// === Write path === //

/// Writes every dirty mapped block of a locked page. The page is unlocked
/// before I/O completes; `Writeback` covers the in-flight window.
///
/// A mid-page mapper failure still submits the blocks that were already
/// mapped dirty (leaving freshly allocated blocks unwritten would expose
/// stale data), records the error on mapping and page, and returns it.
pub fn write_full_page(
    inode: &Arc<Inode>,
    page: &Arc<Page>,
    wbc: &mut WritebackControl,
) -> Result<(), CacheError> {
    assert!(page.is_locked(), "writing an unlocked page");

    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    if !page.has_buffers() {
        bh::attach_ring(page, block_size, BhState::DIRTY | BhState::UPTODATE);
    }
    let ring = page.ring_snapshot().expect("ring just attached");

    let block_bits = block_size.trailing_zeros();
    let last_block: i64 = (inode.size() as i64 - 1) >> block_bits;
    let mut iblock: i64 = (page.index() << mapping.size_bits(block_size)) as i64;
    let mut err = None;

    for bh in &ring {
        if iblock > last_block {
            // Fully past EOF: never write, but the region is trivially
            // valid.
            bh.clear_bits(BhState::DIRTY);
            bh.set_uptodate();
        } else if (!bh.is_mapped() || bh.is(BhState::DELAY)) && bh.is_dirty() {
            match inode.mapper().map_block(inode, iblock as u64, bh, true) {
                Ok(()) => {
                    if bh.is_new() {
                        bh.clear_bits(BhState::NEW);
                        unmap_underlying(bh);
                    }
                }
                Err(e) => {
                    err.get_or_insert(e);
                    mapping.set_error(e);
                    page.set_error();
                }
            }
        }
        iblock += 1;
    }

    let mut staged: RingSnapshot = SmallVec::new();
    let mut blocked = false;
    for bh in &ring {
        if !bh.is_mapped() {
            continue;
        }
        if wbc.sync_all() {
            bh.lock();
        } else if !bh.try_lock() {
            blocked = true;
            break;
        }
        if bh.test_clear_dirty() {
            bh.set_end_io(end_io(end_buffer_async_write));
            bh.set_bits(BhState::ASYNC_WRITE);
            staged.push(bh.clone());
        } else {
            bh.unlock();
        }
    }

    if blocked {
        // Opportunistic writeback lost the race for a buffer lock. Unwind
        // and leave the page dirty for a later pass.
        for bh in &staged {
            bh.clear_bits(BhState::ASYNC_WRITE);
            bh.set_bits(BhState::DIRTY);
            bh.take_end_io();
            bh.unlock();
        }
        dirty::redirty_page(page);
        wbc.pages_skipped += 1;
        page.unlock();
        debug!(page = page.index(), "writepage skipped: buffer locked");
        return Ok(());
    }

    dirty::set_page_writeback(page);
    page.unlock();

    let underway = staged.len();
    for bh in &staged {
        io::submit_write(bh);
    }
    if underway == 0 {
        // Every block was written by hand already.
        dirty::end_page_writeback(page);
    } else if let Some(dev) = inode.dev() {
        dev.disk().kick();
    }

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Prepares `[from, to)` of a locked page for a caller write: maps the
/// blocks in the range (allocating as needed), zeroes fresh allocations
/// outside the range, and reads any partially-overwritten block that is not
/// yet valid.
pub fn prepare_partial_write(
    inode: &Arc<Inode>,
    page: &Arc<Page>,
    from: usize,
    to: usize,
) -> Result<(), CacheError> {
    assert!(page.is_locked(), "preparing an unlocked page");
    assert!(from <= to && to <= page.size());

    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    if !page.has_buffers() {
        bh::attach_ring(page, block_size, BhState::empty());
    }
    let ring = page.ring_snapshot().expect("ring just attached");
    let first_block = page.index() << mapping.size_bits(block_size);

    let mut wait_for: RingSnapshot = SmallVec::new();
    let mut err = None;

    for (i, bh) in ring.iter().enumerate() {
        let start = bh.offset_in_page();
        let end = start + bh.size();

        if end <= from || start >= to {
            // Outside the write range: only inherit validity.
            if page.is_uptodate() && !bh.is_uptodate() {
                bh.set_uptodate();
            }
            continue;
        }

        if !bh.is_mapped() {
            if let Err(e) = inode
                .mapper()
                .map_block(inode, first_block + i as u64, bh, true)
            {
                err = Some(e);
                break;
            }
            if bh.is_new() {
                unmap_underlying(bh);
                if page.is_uptodate() {
                    bh.set_uptodate();
                    continue;
                }
                // Zero whatever the caller is not about to overwrite.
                if start < from {
                    page.zero_range(start, from.min(end));
                }
                if end > to {
                    page.zero_range(to.max(start), end);
                }
                continue;
            }
        }

        if page.is_uptodate() {
            if !bh.is_uptodate() {
                bh.set_uptodate();
            }
            continue;
        }

        if !bh.is_uptodate()
            && !bh.is(BhState::DELAY | BhState::UNWRITTEN)
            && (start < from || end > to)
        {
            // Partially overwritten block with stale content: read it.
            bh.lock();
            if bh.is_uptodate() {
                bh.unlock();
                continue;
            }
            bh.set_end_io(end_io(io::end_buffer_read_sync));
            io::submit_read(bh);
            wait_for.push(bh.clone());
        }
    }

    if let Some(dev) = inode.dev() {
        dev.disk().kick();
    }
    for bh in &wait_for {
        bh.wait_on();
        if !bh.is_uptodate() {
            err.get_or_insert(CacheError::Io);
        }
    }

    if let Some(e) = err {
        // Leave no freshly allocated block with stale content behind.
        for bh in &ring {
            if bh.is_new() {
                page.zero_range(bh.offset_in_page(), bh.offset_in_page() + bh.size());
                bh.set_uptodate();
                bh.clear_bits(BhState::NEW);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Commits a prepared write: the range's blocks become valid and dirty. The
/// caller updates the file size under its own locks.
pub fn commit_partial_write(page: &Arc<Page>, from: usize, to: usize) {
    assert!(page.is_locked(), "committing an unlocked page");

    let Some(ring) = page.ring_snapshot() else {
        return;
    };
    let mut all_uptodate = true;
    for bh in &ring {
        let start = bh.offset_in_page();
        let end = start + bh.size();
        if end <= from || start >= to {
            if !bh.is_uptodate() {
                all_uptodate = false;
            }
        } else {
            bh.set_uptodate();
            dirty::mark_buffer_dirty(bh);
            bh.clear_bits(BhState::NEW);
        }
    }
    if all_uptodate {
        page.set_uptodate();
    }
}

/// Zeroes the tail of the block straddling `from`, for truncate of a size
/// that is not block-aligned. The block is read first if its content is
/// stale, and ends dirty.
pub fn truncate_page(inode: &Arc<Inode>, from: u64) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let block_size = mapping.block_size() as u64;
    if from % block_size == 0 {
        return Ok(());
    }

    let page_bits = mapping.page_size().trailing_zeros();
    let index = from >> page_bits;
    let Some(page) = mapping.page_at(index) else {
        return Ok(());
    };
    page.lock();

    let result = truncate_page_locked(inode, &page, from);
    page.unlock();
    result
}

fn truncate_page_locked(
    inode: &Arc<Inode>,
    page: &Arc<Page>,
    from: u64,
) -> Result<(), CacheError> {
    let mapping = inode.mapping();
    let block_size = mapping.block_size();
    if !page.has_buffers() {
        bh::attach_ring(page, block_size, BhState::empty());
    }
    let ring = page.ring_snapshot().expect("ring just attached");

    let offset = (from & (mapping.page_size() as u64 - 1)) as usize;
    let slot = offset / block_size;
    let bh = &ring[slot];
    let block = (page.index() << mapping.size_bits(block_size)) + slot as u64;

    if !bh.is_mapped() {
        inode.mapper().map_block(inode, block, bh, false)?;
        if !bh.is_mapped() {
            // A hole reads as zeroes already.
            return Ok(());
        }
    }

    if page.is_uptodate() {
        bh.set_uptodate();
    }
    if !bh.is_uptodate() && !bh.is(BhState::NEW | BhState::DELAY | BhState::UNWRITTEN) {
        io::read_buffer_sync(bh)?;
    }

    page.zero_range(offset, (slot + 1) * block_size);
    dirty::mark_buffer_dirty(bh);
    Ok(())
}

/// Discards any alias of a freshly allocated device block sitting in the
/// device's own page cache, so old metadata cannot overwrite new data.
pub(crate) fn unmap_underlying(new_bh: &Arc<BufferHead>) {
    let Some(dev) = new_bh.dev() else {
        return;
    };
    let Some(alias) = crate::cache::find_buffer_in_pages(&dev, new_bh.block(), new_bh.size())
    else {
        return;
    };
    if !Arc::ptr_eq(&alias, new_bh) {
        debug!(
            dev = dev.id(),
            block = new_bh.block(),
            "discarding stale alias of a newly allocated block"
        );
        alias.clear_bits(BhState::DIRTY);
        alias.wait_on();
        alias.clear_bits(BhState::REQ);
    }
    alias.put_ref();
}
