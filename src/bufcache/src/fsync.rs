//! Flushing an inode's associated buffers: device-mapping handles (bitmaps,
//! index blocks) pinned to a file so fsync of the file persists them.

use std::sync::Arc;

use crate::bh::BufferHead;
use crate::error::CacheError;
use crate::inode::Inode;
use crate::io;

/// Writes out and waits for every buffer on the inode's associated list.
///
/// Phase one drains the list into a local one, submitting each dirty
/// buffer under a plugged queue. Phase two walks the local list in reverse:
/// buffers that got redirtied meanwhile go back on the inode's list, the
/// rest are waited on and checked. A final pass waits out anything still
/// locked without requeueing newly dirtied buffers. The first error from
/// any phase is returned.
pub fn fsync_associated(inode: &Arc<Inode>) -> Result<(), CacheError> {
    let Some(dev) = inode.dev() else {
        return Ok(());
    };
    let backing = dev.mapping().clone();
    let disk = dev.disk().clone();
    let mut err: Option<CacheError> = None;
    let mut local: Vec<Arc<BufferHead>> = Vec::new();

    disk.plug();
    loop {
        let bh = {
            let _private = backing.private_lock.lock();
            inode.assoc.lock().pop_front()
        };
        let Some(bh) = bh else { break };
        if bh.is_dirty() {
            bh.get_ref();
            io::write_dirty_buffer(&bh);
            bh.put_ref();
        }
        local.push(bh);
    }
    disk.kick();

    for bh in local.iter().rev() {
        if bh.is_dirty() {
            // Redirtied since we drained it; it stays associated and a
            // later fsync picks it up.
            let _private = backing.private_lock.lock();
            inode.assoc.lock().push_back(bh.clone());
        } else {
            bh.wait_on();
            if !bh.is_uptodate() {
                err.get_or_insert(CacheError::Io);
            }
            bh.set_assoc_mapping(None);
            bh.put_ref();
        }
    }

    if let Err(e) = osync_associated(inode) {
        err.get_or_insert(e);
    }

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Waits out buffers still locked on the inode's list without requeueing
/// ones dirtied after the main flush. Loops until a pass finds nothing in
/// flight.
fn osync_associated(inode: &Arc<Inode>) -> Result<(), CacheError> {
    let backing = inode.dev().map(|d| d.mapping().clone());
    let mut err = None;
    loop {
        let snapshot: Vec<Arc<BufferHead>> = {
            let _private = backing.as_ref().map(|m| m.private_lock.lock());
            inode.assoc.lock().iter().cloned().collect()
        };
        let mut waited = false;
        for bh in snapshot {
            if bh.is_locked() {
                waited = true;
                bh.wait_on();
                if !bh.is_uptodate() {
                    err.get_or_insert(CacheError::Io);
                }
            }
        }
        if !waited {
            break;
        }
    }
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Detaches every associated buffer, or reports `false` if any is still
/// dirty. `true` means the inode holds nothing back from being freed.
pub fn remove_inode_buffers(inode: &Arc<Inode>) -> bool {
    let backing = inode.dev().map(|d| d.mapping().clone());
    let _private = backing.as_ref().map(|m| m.private_lock.lock());
    let mut assoc = inode.assoc.lock();
    if assoc.iter().any(|bh| bh.is_dirty()) {
        return false;
    }
    for bh in assoc.drain(..) {
        bh.set_assoc_mapping(None);
        bh.put_ref();
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dirty::mark_buffer_dirty_inode;
    use crate::testutil::{file_rig, wait_until};
    use crate::CacheConfig;

    fn rig_with_assoc(blocks: &[u64]) -> (crate::testutil::FileRig, Vec<crate::bh::BufferRef>) {
        let f = file_rig(CacheConfig::default(), 2048, 1024, 64 * 1024, 64);
        let mut handles = Vec::new();
        for &block in blocks {
            let bh = f.rig.cache.read(&f.rig.dev, block, 1024).unwrap();
            bh.page().unwrap().with_data_mut(|d| {
                let off = bh.offset_in_page();
                d[off..off + 1024].fill(block as u8);
            });
            mark_buffer_dirty_inode(bh.inner(), &f.inode);
            handles.push(bh);
        }
        (f, handles)
    }

    #[test]
    fn fsync_flushes_associated_buffers() {
        let (f, handles) = rig_with_assoc(&[10, 11, 20]);
        assert_eq!(f.inode.assoc.lock().len(), 3);

        fsync_associated(&f.inode).unwrap();

        let image = f.rig.backend.snapshot();
        for &block in &[10u64, 11, 20] {
            assert!(
                image[block as usize * 1024..][..1024]
                    .iter()
                    .all(|&b| b == block as u8),
                "block {block} not flushed"
            );
        }
        // Clean buffers leave the association.
        assert_eq!(f.inode.assoc.lock().len(), 0);
        for bh in &handles {
            assert!(!bh.is_dirty());
            assert!(bh.is_uptodate());
        }
    }

    #[test]
    fn fsync_propagates_write_errors() {
        let (f, _handles) = rig_with_assoc(&[10]);
        f.rig.backend.fail_writes(10 * 1024, 1024, 1);
        assert_eq!(fsync_associated(&f.inode), Err(CacheError::Io));
        // The transient fault cleared; a redirty and retry succeeds.
        let bh = f.rig.cache.find(&f.rig.dev, 10, 1024).unwrap();
        bh.set_uptodate();
        mark_buffer_dirty_inode(bh.inner(), &f.inode);
        assert!(fsync_associated(&f.inode).is_ok());
    }

    #[test]
    fn remove_inode_buffers_refuses_dirty_state() {
        let (f, handles) = rig_with_assoc(&[12]);
        assert!(!remove_inode_buffers(&f.inode));

        fsync_associated(&f.inode).unwrap();
        assert!(remove_inode_buffers(&f.inode));
        assert!(wait_until(Duration::from_secs(1), || {
            f.inode.assoc.lock().is_empty()
        }));
        drop(handles);
    }

    #[test]
    fn forget_buffer_cancels_dirtiness_and_association() {
        let (f, mut handles) = rig_with_assoc(&[14]);
        let bh = handles.pop().unwrap();
        let writes_before = f
            .rig
            .disk
            .stats()
            .writes
            .load(std::sync::atomic::Ordering::Relaxed);

        crate::io::forget_buffer(bh);
        assert_eq!(f.inode.assoc.lock().len(), 0);

        fsync_associated(&f.inode).unwrap();
        assert_eq!(
            f.rig
                .disk
                .stats()
                .writes
                .load(std::sync::atomic::Ordering::Relaxed),
            writes_before,
            "forgotten buffer must not be written"
        );
    }
}
