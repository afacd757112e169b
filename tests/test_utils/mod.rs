use std::sync::{Arc, Mutex};

use small_freelist::{
    io::{self, data_io, node_io},
    page::PageSlot,
    utils, MemWal, PageId, PageMemory, PagesList, PagesListConfig, ReuseBag, ReuseList,
    SmallError, FLAG_DATA, FLAG_IDX,
};

/// Page size used by most tests: a node page holds exactly two ids, so
/// splits and merges happen after a handful of operations.
pub const TEST_PAGE_SIZE: usize = 64;

pub const CACHE_ID: u32 = 7;

pub fn setup() {
    utils::init_log();
}

pub struct TestEnv {
    pub pm: Arc<PageMemory>,
    pub wal: Arc<MemWal>,
    pub list: Arc<PagesList>,
    pub meta_page_id: PageId,
    pub recycle_sink: Arc<CaptureReuseList>,
}

/// Build a list over a fresh page memory. Lists without a reuse bucket
/// get a capturing sink so tests can observe recycled node pages.
pub fn new_env(
    page_size: usize,
    buckets: usize,
    reuse_bucket: Option<usize>,
) -> TestEnv {
    setup();

    let pm = Arc::new(PageMemory::new(page_size));
    let wal = Arc::new(MemWal::new());
    let recycle_sink = Arc::new(CaptureReuseList::new());

    let meta_page_id = pm.allocate_page_no_reuse(FLAG_IDX).unwrap();

    let mut config = PagesListConfig::new("test-list", CACHE_ID, buckets, meta_page_id);
    config.reuse_bucket = reuse_bucket;
    // keep growth available regardless of the test machine's cpu count
    config.max_stripes_per_bucket = 8;

    let list = Arc::new(PagesList::new(
        config,
        pm.clone(),
        Some(wal.clone()),
        Some(recycle_sink.clone()),
    ));
    list.init(true).unwrap();

    TestEnv {
        pm,
        wal,
        list,
        meta_page_id,
        recycle_sink,
    }
}

/// A reuse list that only records what it is given. Stands in for the
/// engine-wide reuse list when the list under test has no reuse bucket.
pub struct CaptureReuseList {
    recycled: Mutex<Vec<PageId>>,
}

impl CaptureReuseList {
    pub fn new() -> Self {
        Self {
            recycled: Mutex::new(Vec::new()),
        }
    }

    pub fn recycled(&self) -> Vec<PageId> {
        self.recycled.lock().unwrap().clone()
    }
}

impl ReuseList for CaptureReuseList {
    fn add_for_recycle(&self, bag: &mut ReuseBag) -> Result<(), SmallError> {
        let mut recycled = self.recycled.lock().unwrap();
        while let Some(id) = bag.poll_free_page() {
            recycled.push(id);
        }
        Ok(())
    }

    fn take_recycled_page(&self) -> Result<Option<PageId>, SmallError> {
        Ok(self.recycled.lock().unwrap().pop())
    }
}

/// Allocate and initialize one data page.
pub fn new_data_page(pm: &PageMemory) -> PageId {
    let id = pm.allocate_page_no_reuse(FLAG_DATA).unwrap();
    let page = pm.page(id).unwrap();
    let mut buf = page.write();
    data_io::init_new_page(&mut buf, id);
    id
}

/// Latch a data page and register it in `bucket`, the way the engine
/// does after filling part of the page.
pub fn put_data(list: &PagesList, pm: &PageMemory, id: PageId, bucket: usize) {
    let page = pm.page(id).unwrap();
    let mut buf = page.write();
    list.put_data_page(&page, &mut buf, bucket).unwrap();
}

/// Latch a data page and take it off its list.
pub fn remove_data(list: &PagesList, pm: &PageMemory, id: PageId, bucket: usize) -> bool {
    let page = pm.page(id).unwrap();
    let mut buf = page.write();
    list.remove_data_page(&page, &mut buf, bucket).unwrap()
}

/// The back-pointer currently stored in a data page.
pub fn free_list_of(pm: &PageMemory, id: PageId) -> PageId {
    let page = pm.page(id).unwrap();
    let buf = page.read();
    data_io::get_free_list_page_id(&buf)
}

/// Payload of a node page.
pub fn node_pages(pm: &PageMemory, node_id: PageId) -> Vec<PageId> {
    let page = pm.page(node_id).unwrap();
    let buf = page.read();
    assert_eq!(io::get_page_id(&buf), node_id);
    node_io::pages(&buf)
}

/// Walk a stripe from its tail to its head, returning node ids in
/// head-to-tail order.
pub fn stripe_nodes(pm: &PageMemory, tail: PageId) -> Vec<PageId> {
    let mut nodes = vec![tail];
    let mut cur = tail;
    loop {
        let page = pm.page(cur).unwrap();
        let buf = page.read();
        assert_eq!(io::get_page_id(&buf), cur, "stale id on stripe walk");
        let prev = node_io::get_previous_id(&buf);
        if prev.is_null() {
            break;
        }
        nodes.push(prev);
        cur = prev;
    }
    nodes.reverse();
    nodes
}

fn with_node_page<T>(pm: &PageMemory, id: PageId, f: impl FnOnce(&PageSlot, &[u8]) -> T) -> T {
    let page = pm.page(id).unwrap();
    let buf = page.read();
    f(&page, &buf)
}

/// Structural integrity of every stripe of every bucket:
///
/// - every tail in the stripe table is a node page with no successor
/// - prev/next links agree in both directions along every chain
/// - the head of every chain has no predecessor
/// - outside the reuse bucket, every listed data page points back at
///   the node that lists it
///
/// Only sound while no other thread is mutating the list.
pub fn check_integrity(list: &PagesList, pm: &PageMemory) {
    for bucket in 0..list.buckets() {
        let is_reuse = list.reuse_bucket() == Some(bucket);

        for tail in list.bucket_tails(bucket) {
            with_node_page(pm, tail, |_, buf| {
                node_io::check_type(buf).unwrap();
                assert!(
                    node_io::get_next_id(buf).is_null(),
                    "tail {} has a successor",
                    tail
                );
            });

            let nodes = stripe_nodes(pm, tail);

            // link agreement in both directions
            for pair in nodes.windows(2) {
                let (left, right) = (pair[0], pair[1]);
                with_node_page(pm, left, |_, buf| {
                    assert_eq!(node_io::get_next_id(buf), right);
                });
                with_node_page(pm, right, |_, buf| {
                    assert_eq!(node_io::get_previous_id(buf), left);
                });
            }

            with_node_page(pm, nodes[0], |_, buf| {
                assert!(node_io::get_previous_id(buf).is_null());
            });

            if !is_reuse {
                for node in &nodes {
                    for data_id in node_pages(pm, *node) {
                        assert_eq!(
                            free_list_of(pm, data_id),
                            *node,
                            "data page {} does not point back at node {}",
                            data_id,
                            node
                        );
                    }
                }
            }
        }
    }
}
