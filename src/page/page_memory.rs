use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, RwLockReadGuard, RwLockWriteGuard,
};
use std::sync::RwLock;

use log::debug;

use crate::{
    error::SmallError,
    freelist::ReuseBag,
    types::ConcurrentHashMap,
    utils::HandyRwLock,
};

use super::page_id::PageId;

/// One page of the in-memory page store.
///
/// The `RwLock` around the buffer is the page latch: `read` / `write`
/// are the blocking acquisitions, `try_write` the non-blocking one.
/// Guards release the latch on drop.
pub struct PageSlot {
    index: u32,

    buf: RwLock<Vec<u8>>,

    dirty: AtomicBool,

    // When set, the next checkpoint captures this page as a full image
    // and delta records must not be logged for it.
    full_page_wal: AtomicBool,
}

impl PageSlot {
    fn new(index: u32, buf: Vec<u8>) -> Self {
        Self {
            index,
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(false),
            full_page_wal: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.buf.rl()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.wl()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, Vec<u8>>> {
        self.buf.try_write().ok()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_full_page_wal(&self, full: bool) {
        self.full_page_wal.store(full, Ordering::Release);
    }

    pub fn full_page_wal(&self) -> bool {
        self.full_page_wal.load(Ordering::Acquire)
    }
}

/// In-memory page store with per-page latches.
///
/// Pages are addressed by the index part of their id; the tagged parts
/// (flag, rotation) live in the page header and are validated by the
/// callers that care. Pages are never dropped while the store is alive,
/// recycling rewrites them in place.
pub struct PageMemory {
    page_size: usize,

    pages: ConcurrentHashMap<u32, Arc<PageSlot>>,

    // index 0 is the null id, allocation starts at 1
    next_index: AtomicU32,

    allocations: AtomicU64,
}

impl PageMemory {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: ConcurrentHashMap::new(),
            next_index: AtomicU32::new(1),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocate a page, polling the reuse bag first. An id taken from
    /// the bag keeps its rotation and only changes its type flag.
    pub fn allocate_page(
        &self,
        bag: Option<&mut ReuseBag>,
        flag: u8,
    ) -> Result<PageId, SmallError> {
        if let Some(bag) = bag {
            if let Some(id) = bag.poll_free_page() {
                debug!("reusing page {} from bag", id);
                return Ok(id.with_flag(flag));
            }
        }

        self.allocate_page_no_reuse(flag)
    }

    /// Allocate a fresh zeroed page, never touching any reuse source.
    pub fn allocate_page_no_reuse(&self, flag: u8) -> Result<PageId, SmallError> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        if index == u32::MAX {
            return Err(SmallError::new("page store exhausted"));
        }

        let slot = Arc::new(PageSlot::new(index, vec![0; self.page_size]));
        self.pages.insert(index, slot);
        self.allocations.fetch_add(1, Ordering::SeqCst);

        let id = PageId::new(flag, 0, index);
        debug!("allocated page {}", id);
        Ok(id)
    }

    /// Number of fresh allocations so far. Reuse via bag does not count.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn page(&self, id: PageId) -> Result<Arc<PageSlot>, SmallError> {
        self.pages
            .get(&id.index())
            .ok_or_else(|| SmallError::corrupted(&format!("page {} not allocated", id)))
    }

    /// Like `page`, but materializes a zeroed slot for an unknown index.
    /// Used by WAL replay, where allocation is implied by the records.
    pub fn page_or_alloc(&self, id: PageId) -> Result<Arc<PageSlot>, SmallError> {
        let index = id.index();
        self.pages.get_or_insert(&index, |_| {
            let next = self.next_index.load(Ordering::SeqCst);
            if index >= next {
                self.next_index.store(index + 1, Ordering::SeqCst);
            }
            Ok(Arc::new(PageSlot::new(index, vec![0; self.page_size])))
        })
    }

    pub fn page_indexes(&self) -> Vec<u32> {
        let mut indexes = self.pages.keys();
        indexes.sort_unstable();
        indexes
    }

    /// Deep copy of every page buffer. The copy shares nothing with the
    /// original, so it can serve as the "crash image" in replay tests.
    pub fn snapshot(&self) -> PageMemory {
        let copy = PageMemory::new(self.page_size);
        for index in self.page_indexes() {
            if let Some(slot) = self.pages.get(&index) {
                let buf = slot.read().clone();
                copy.pages.insert(index, Arc::new(PageSlot::new(index, buf)));
            }
        }
        copy.next_index
            .store(self.next_index.load(Ordering::SeqCst), Ordering::SeqCst);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::page_id::FLAG_DATA;

    #[test]
    fn test_allocate_and_latch() {
        let pm = PageMemory::new(128);

        let id = pm.allocate_page_no_reuse(FLAG_DATA).unwrap();
        assert_eq!(id.index(), 1);
        assert_eq!(pm.allocations(), 1);

        let page = pm.page(id).unwrap();
        {
            let mut buf = page.write();
            buf[0] = 0xab;

            // the write latch is exclusive
            assert!(page.try_write().is_none());
        }
        assert_eq!(page.read()[0], 0xab);
    }

    #[test]
    fn test_bag_allocation_skips_fresh_pages() {
        let pm = PageMemory::new(128);
        let recycled = pm.allocate_page_no_reuse(FLAG_DATA).unwrap().rotated();

        let mut bag = ReuseBag::singleton(recycled);
        let id = pm.allocate_page(Some(&mut bag), FLAG_DATA).unwrap();

        assert_eq!(id.index(), recycled.index());
        assert_eq!(pm.allocations(), 1);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let pm = PageMemory::new(64);
        let id = pm.allocate_page_no_reuse(FLAG_DATA).unwrap();
        pm.page(id).unwrap().write()[3] = 7;

        let snap = pm.snapshot();
        pm.page(id).unwrap().write()[3] = 9;

        assert_eq!(snap.page(id).unwrap().read()[3], 7);
    }
}
