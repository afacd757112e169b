//! The striped free-page list.
//!
//! Every bucket owns a set of stripes; each stripe is an on-disk
//! doubly-linked list of node pages whose payload is an array of page
//! ids. Insertions always happen at a stripe's tail, so concurrent
//! writers are spread over stripes instead of fighting over one page.
//! Structural changes to a bucket's stripe set go through a CAS on the
//! stripe array; everything touching page contents happens under the
//! per-page write latch.
//!
//! Lock order for node pages is next, then current, then previous.
//! Every multi-page operation in this file respects it.

use std::sync::Arc;

use crossbeam::epoch;
use itertools::Itertools;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::Rng;

use crate::{
    error::SmallError,
    io::{self, data_io, meta_io, node_io, T_DATA},
    page::{PageId, PageMemory, PageSlot, FLAG_DATA, FLAG_IDX, NULL_PAGE_ID},
    types::SmallResult,
    wal::{WalRecord, WalSink},
};

use super::{
    reuse_bag::ReuseBag,
    stripe::{BucketTable, Stripe},
};

/// Non-blocking latch attempts on a tail page before the bucket grows a
/// stripe (or, at the stripe cap, before falling back to a blocking
/// latch).
pub const DEFAULT_TRY_LOCK_ATTEMPTS: usize = 10;

static DEFAULT_MAX_STRIPES: Lazy<usize> = Lazy::new(|| {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    std::cmp::max(1, std::cmp::min(8, 2 * cpus))
});

/// Hard cap on stripes per bucket: `min(8, 2 * cpus)` unless overridden
/// in the config.
pub fn default_max_stripes_per_bucket() -> usize {
    *DEFAULT_MAX_STRIPES
}

pub struct PagesListConfig {
    pub name: String,

    pub cache_id: u32,

    /// Number of buckets. The meaning of a bucket index (fill class,
    /// reuse pool) belongs to the engine.
    pub buckets: usize,

    /// Head of the meta page chain used by `save_metadata` / `init`.
    pub meta_page_id: PageId,

    /// The bucket that collects fully-empty recyclable pages, if this
    /// list has one.
    pub reuse_bucket: Option<usize>,

    pub try_lock_attempts: usize,

    pub max_stripes_per_bucket: usize,
}

impl PagesListConfig {
    pub fn new(name: &str, cache_id: u32, buckets: usize, meta_page_id: PageId) -> Self {
        Self {
            name: name.to_string(),
            cache_id,
            buckets,
            meta_page_id,
            reuse_bucket: None,
            try_lock_attempts: DEFAULT_TRY_LOCK_ATTEMPTS,
            max_stripes_per_bucket: default_max_stripes_per_bucket(),
        }
    }

    pub fn with_reuse_bucket(mut self, bucket: usize) -> Self {
        self.reuse_bucket = Some(bucket);
        self
    }
}

/// Receiver of recycled pages. A list whose config names a reuse bucket
/// is its own receiver; a list without one needs an external receiver
/// at construction time.
pub trait ReuseList: Send + Sync {
    fn add_for_recycle(&self, bag: &mut ReuseBag) -> SmallResult;

    fn take_recycled_page(&self) -> Result<Option<PageId>, SmallError>;
}

pub struct PagesList {
    config: PagesListConfig,

    pm: Arc<PageMemory>,

    wal: Option<Arc<dyn WalSink>>,

    reuse_list: Option<Arc<dyn ReuseList>>,

    table: BucketTable,
}

impl PagesList {
    pub fn new(
        config: PagesListConfig,
        pm: Arc<PageMemory>,
        wal: Option<Arc<dyn WalSink>>,
        reuse_list: Option<Arc<dyn ReuseList>>,
    ) -> Self {
        let table = BucketTable::new(config.buckets);
        Self {
            config,
            pm,
            wal,
            reuse_list,
            table,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // ------------------------------------------------------------------
    // init / metadata
    // ------------------------------------------------------------------

    /// Prepare the list for use. With `init_new` the head meta page is
    /// initialized empty; otherwise the meta chain is traversed and the
    /// persisted stripe tails are installed per bucket.
    pub fn init(&self, init_new: bool) -> SmallResult {
        if init_new {
            let page = self.pm.page(self.config.meta_page_id)?;
            let mut buf = page.write();
            meta_io::init_new_page(&mut buf, self.config.meta_page_id);
            page.set_dirty(true);

            info!(
                "{}: initialized meta page {}",
                self.config.name, self.config.meta_page_id
            );
            return Ok(());
        }

        let mut items: Vec<(u16, PageId)> = Vec::new();

        let mut cur = self.config.meta_page_id;
        while !cur.is_null() {
            let page = self.pm.page(cur)?;
            let buf = page.read();
            meta_io::check_type(&buf)?;

            items.extend(meta_io::items(&buf));

            let next = meta_io::get_next_meta_page_id(&buf);
            if next == cur {
                return Err(SmallError::corrupted("meta page chain loop"));
            }
            cur = next;
        }

        let restored = items.len();

        for (bucket, tails) in items
            .into_iter()
            .into_group_map()
            .into_iter()
            .sorted_by_key(|(bucket, _)| *bucket)
        {
            let bucket = bucket as usize;
            if bucket >= self.config.buckets {
                return Err(SmallError::corrupted(&format!(
                    "persisted bucket {} out of range",
                    bucket
                )));
            }

            let stripes = tails
                .into_iter()
                .map(|tail| Arc::new(Stripe::new(tail)))
                .collect();
            self.table.cas_install(bucket, stripes)?;
        }

        info!(
            "{}: restored {} stripe tails from meta chain {}",
            self.config.name, restored, self.config.meta_page_id
        );
        Ok(())
    }

    /// Persist every bucket's stripe tails into the meta page chain.
    ///
    /// The existing chain is rewritten in place, overflow pages are
    /// allocated directly (never from the reuse pool), and any unused
    /// tail of the old chain is zeroed but kept.
    pub fn save_metadata(&self) -> SmallResult {
        let mut pairs: Vec<(u16, PageId)> = Vec::new();
        for bucket in 0..self.config.buckets {
            for stripe in self.table.stripes(bucket) {
                pairs.push((bucket as u16, stripe.tail_id()));
            }
        }

        let saved = pairs.len();
        let mut iter = pairs.into_iter().peekable();

        let mut cur_id = self.config.meta_page_id;
        loop {
            let page = self.pm.page(cur_id)?;
            let mut buf = page.write();
            meta_io::check_type(&buf)?;

            meta_io::reset_count(&mut buf);
            while let Some((bucket, tail)) = iter.peek().cloned() {
                if !meta_io::add_item(&mut buf, bucket, tail) {
                    break;
                }
                iter.next();
            }
            page.set_dirty(true);

            let next = meta_io::get_next_meta_page_id(&buf);
            if next == cur_id {
                return Err(SmallError::corrupted("meta page chain loop"));
            }

            if iter.peek().is_none() {
                drop(buf);
                self.zero_meta_chain(next)?;
                break;
            }

            if next.is_null() {
                let new_id = self.pm.allocate_page_no_reuse(FLAG_IDX)?;
                {
                    let new_page = self.pm.page(new_id)?;
                    let mut new_buf = new_page.write();
                    meta_io::init_new_page(&mut new_buf, new_id);
                    new_page.set_dirty(true);
                }
                meta_io::set_next_meta_page_id(&mut buf, new_id);
                cur_id = new_id;
            } else {
                cur_id = next;
            }
        }

        info!("{}: saved {} stripe tails", self.config.name, saved);
        Ok(())
    }

    // Surplus meta pages of an earlier, longer chain are kept around
    // with a zeroed count so the next save can grow into them again.
    fn zero_meta_chain(&self, mut cur: PageId) -> SmallResult {
        while !cur.is_null() {
            let page = self.pm.page(cur)?;
            let mut buf = page.write();
            meta_io::check_type(&buf)?;

            meta_io::reset_count(&mut buf);
            page.set_dirty(true);

            let next = meta_io::get_next_meta_page_id(&buf);
            if next == cur {
                return Err(SmallError::corrupted("meta page chain loop"));
            }
            cur = next;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // put
    // ------------------------------------------------------------------

    /// Register a data page in `bucket`. The caller holds the data
    /// page's write latch and passes its buffer.
    pub fn put_data_page(
        &self,
        data_page: &PageSlot,
        data_buf: &mut [u8],
        bucket: usize,
    ) -> SmallResult {
        data_io::check_type(data_buf)?;
        self.put(Some((data_page, data_buf)), None, bucket)
    }

    /// Deposit a bag of free pages into `bucket`, draining the bag.
    pub fn put_reuse_bag(&self, bag: &mut ReuseBag, bucket: usize) -> SmallResult {
        self.put(None, Some(bag), bucket)
    }

    fn put(
        &self,
        mut data: Option<(&PageSlot, &mut [u8])>,
        mut bag: Option<&mut ReuseBag>,
        bucket: usize,
    ) -> SmallResult {
        debug_assert!(data.is_some() != bag.is_some());
        self.check_bucket(bucket)?;

        let mut lock_attempts = 0;
        loop {
            let stripe = match self.random_stripe(bucket) {
                Some(stripe) => stripe,
                // the bootstrap stripe never consumes the caller's bag;
                // the bag is drained into it by the handler below
                None => self.add_stripe(bucket, None, true)?,
            };

            // contention growth may have consumed the whole bag already
            if let Some(b) = bag.as_deref_mut() {
                if b.is_empty() {
                    return Ok(());
                }
            }

            let tail_id = stripe.tail_id();
            let page = self.pm.page(tail_id)?;

            // non-blocking attempts stay on this tail; only crossing the
            // threshold re-selects a stripe (after growing one when the
            // cap allows) or falls back to a blocking latch
            let latched = loop {
                if let Some(buf) = page.try_write() {
                    lock_attempts = 0;
                    break Some(buf);
                }

                lock_attempts += 1;
                if lock_attempts < self.config.try_lock_attempts {
                    continue;
                }

                lock_attempts = 0;
                if self.table.count(bucket) < self.config.max_stripes_per_bucket {
                    // relieve the contention instead of waiting
                    self.add_stripe(bucket, bag.as_deref_mut(), false)?;
                    break None;
                }
                break Some(page.write());
            };
            let mut buf = match latched {
                Some(buf) => buf,
                None => continue,
            };

            // the tail may have been recycled between the stripe read
            // and the latch; the embedded id tells
            if io::get_page_id(&buf) != tail_id {
                continue;
            }
            node_io::check_type(&buf)?;

            let done = match (&mut data, &mut bag) {
                (Some((data_page, data_buf)), None) => self.put_data_page_locked(
                    tail_id,
                    &page,
                    &mut buf,
                    data_page,
                    data_buf,
                    bucket,
                )?,
                (None, Some(b)) => {
                    self.put_reuse_bag_locked(tail_id, &page, &mut buf, b, bucket)?
                }
                _ => unreachable!(),
            };

            if done {
                return Ok(());
            }
            // raced with a split: the chosen page is no longer a tail
        }
    }

    // Under the tail latch. Returns false when the node turned out not
    // to be a real tail (a split advanced past it).
    fn put_data_page_locked(
        &self,
        node_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        data_page: &PageSlot,
        data_buf: &mut [u8],
        bucket: usize,
    ) -> Result<bool, SmallError> {
        if !node_io::get_next_id(node_buf).is_null() {
            return Ok(false);
        }

        let data_id = io::get_page_id(data_buf);

        if node_io::add_page(node_buf, data_id).is_some() {
            self.log_delta(
                node,
                WalRecord::PagesListAddPage {
                    cache_id: self.config.cache_id,
                    node_page_id: node_id,
                    added_id: data_id,
                },
            )?;
            node.set_dirty(true);

            data_io::set_free_list_page_id(data_buf, node_id);
            self.log_delta(
                data_page,
                WalRecord::DataPageSetFreeListPage {
                    cache_id: self.config.cache_id,
                    data_page_id: data_id,
                    free_list_page_id: node_id,
                },
            )?;
            data_page.set_dirty(true);

            return Ok(true);
        }

        self.split_on_put(node_id, node, node_buf, data_page, data_buf, bucket)?;
        Ok(true)
    }

    // The tail is full: grow the stripe by one node and land the data
    // page there.
    fn split_on_put(
        &self,
        node_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        data_page: &PageSlot,
        data_buf: &mut [u8],
        bucket: usize,
    ) -> SmallResult {
        let data_id = io::get_page_id(data_buf);

        if self.is_reuse_bucket(bucket) {
            // Pages deposited here are free, so the incoming page can
            // itself become the new tail node. Allocating one instead
            // would re-enter this very list and deadlock.
            let new_id = data_id.with_flag(FLAG_IDX);

            node_io::init_new_page(data_buf, new_id, node_id);
            self.log_delta(
                data_page,
                WalRecord::PagesListInitNewPage {
                    cache_id: self.config.cache_id,
                    page_id: new_id,
                    previous_id: node_id,
                    add_data_page_id: NULL_PAGE_ID,
                },
            )?;
            data_page.set_dirty(true);

            node_io::set_next_id(node_buf, new_id);
            self.log_delta(
                node,
                WalRecord::PagesListSetNext {
                    cache_id: self.config.cache_id,
                    page_id: node_id,
                    next_id: new_id,
                },
            )?;
            node.set_dirty(true);

            self.table.update_tail(bucket, node_id, new_id)?;

            debug!(
                "{}: bucket {} split, free page {} became tail node {}",
                self.config.name, bucket, data_id, new_id
            );
            return Ok(());
        }

        let new_id = self.pm.allocate_page_no_reuse(FLAG_IDX)?;
        let new_page = self.pm.page(new_id)?;
        let mut new_buf = new_page.write();

        node_io::init_new_page(&mut new_buf, new_id, node_id);
        node_io::add_page(&mut new_buf, data_id)
            .ok_or_else(|| SmallError::corrupted("fresh node rejected its first page"))?;
        self.log_delta(
            &new_page,
            WalRecord::PagesListInitNewPage {
                cache_id: self.config.cache_id,
                page_id: new_id,
                previous_id: node_id,
                add_data_page_id: data_id,
            },
        )?;
        new_page.set_dirty(true);

        data_io::set_free_list_page_id(data_buf, new_id);
        self.log_delta(
            data_page,
            WalRecord::DataPageSetFreeListPage {
                cache_id: self.config.cache_id,
                data_page_id: data_id,
                free_list_page_id: new_id,
            },
        )?;
        data_page.set_dirty(true);

        node_io::set_next_id(node_buf, new_id);
        self.log_delta(
            node,
            WalRecord::PagesListSetNext {
                cache_id: self.config.cache_id,
                page_id: node_id,
                next_id: new_id,
            },
        )?;
        node.set_dirty(true);

        self.table.update_tail(bucket, node_id, new_id)?;

        debug!(
            "{}: bucket {} split, allocated tail node {}",
            self.config.name, bucket, new_id
        );
        Ok(())
    }

    fn put_reuse_bag_locked(
        &self,
        tail_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        bag: &mut ReuseBag,
        bucket: usize,
    ) -> Result<bool, SmallError> {
        if !node_io::get_next_id(node_buf).is_null() {
            return Ok(false);
        }

        let last_id = self.drain_bag(tail_id, node, node_buf, bag)?;

        if last_id != tail_id {
            self.table.update_tail(bucket, tail_id, last_id)?;
        }
        Ok(true)
    }

    // Drain the bag into `node_id`; when the node fills up, the next id
    // from the bag is promoted into a new node and the drain continues
    // there. Latches along the grown chain stay held until the deepest
    // call returns.
    fn drain_bag(
        &self,
        node_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        bag: &mut ReuseBag,
    ) -> Result<PageId, SmallError> {
        while let Some(free_id) = bag.poll_free_page() {
            if node_io::add_page(node_buf, free_id).is_some() {
                self.log_delta(
                    node,
                    WalRecord::PagesListAddPage {
                        cache_id: self.config.cache_id,
                        node_page_id: node_id,
                        added_id: free_id,
                    },
                )?;
                node.set_dirty(true);
                continue;
            }

            // node full: the free page itself becomes the next node
            let new_id = free_id.with_flag(FLAG_IDX);
            let new_page = self.pm.page(free_id)?;
            let mut new_buf = new_page.write();

            node_io::init_new_page(&mut new_buf, new_id, node_id);
            self.log_delta(
                &new_page,
                WalRecord::PagesListInitNewPage {
                    cache_id: self.config.cache_id,
                    page_id: new_id,
                    previous_id: node_id,
                    add_data_page_id: NULL_PAGE_ID,
                },
            )?;
            new_page.set_dirty(true);

            node_io::set_next_id(node_buf, new_id);
            self.log_delta(
                node,
                WalRecord::PagesListSetNext {
                    cache_id: self.config.cache_id,
                    page_id: node_id,
                    next_id: new_id,
                },
            )?;
            node.set_dirty(true);

            return self.drain_bag(new_id, &new_page, &mut new_buf, bag);
        }

        Ok(node_id)
    }

    // ------------------------------------------------------------------
    // take
    // ------------------------------------------------------------------

    /// Take one page out of `bucket`, or `None` when the bucket has
    /// nothing to give.
    ///
    /// With `init_io` the page is re-initialized in place for the given
    /// layout (under a fresh, rotated id); without it the id is only
    /// rotated when the taken page used to be a node page of the list
    /// itself.
    pub fn take_empty_page(
        &self,
        bucket: usize,
        init_io: Option<(u16, u16)>,
    ) -> Result<Option<PageId>, SmallError> {
        self.check_bucket(bucket)?;

        let mut lock_attempts = 0;
        loop {
            let stripe = match self.random_stripe(bucket) {
                Some(stripe) => stripe,
                None => return Ok(None),
            };

            let tail_id = stripe.tail_id();
            let page = self.pm.page(tail_id)?;

            // same back-off as put: keep retrying this tail until the
            // threshold, then grow a stripe or latch blocking
            let latched = loop {
                if let Some(buf) = page.try_write() {
                    lock_attempts = 0;
                    break Some(buf);
                }

                lock_attempts += 1;
                if lock_attempts < self.config.try_lock_attempts {
                    continue;
                }

                lock_attempts = 0;
                if self.table.count(bucket) < self.config.max_stripes_per_bucket {
                    self.add_stripe(bucket, None, false)?;
                    break None;
                }
                break Some(page.write());
            };
            let mut buf = match latched {
                Some(buf) => buf,
                None => continue,
            };

            if io::get_page_id(&buf) != tail_id {
                continue;
            }
            node_io::check_type(&buf)?;

            if !node_io::get_next_id(&buf).is_null() {
                // a split advanced past this page, it is not the tail
                continue;
            }

            let taken = node_io::take_any_page(&mut buf);
            if !taken.is_null() {
                self.log_delta(
                    &page,
                    WalRecord::PagesListRemovePage {
                        cache_id: self.config.cache_id,
                        node_page_id: tail_id,
                        removed_id: taken,
                    },
                )?;
                page.set_dirty(true);

                debug!(
                    "{}: took page {} from bucket {}",
                    self.config.name, taken, bucket
                );
                return Ok(Some(taken));
            }

            let prev_id = node_io::get_previous_id(&buf);
            if prev_id.is_null() {
                // The stripe is down to one empty node. Dropping it
                // here would churn the stripe set under the meta pages,
                // so an empty tail is left in place.
                return Ok(None);
            }

            // The empty tail node itself becomes the taken page: cut it
            // off the stripe first.
            self.cut_tail(tail_id, prev_id, bucket)?;

            let new_id = match init_io {
                Some((io_type, io_version)) => {
                    self.init_reused_page(&page, &mut buf, tail_id, io_type, io_version)?
                }
                None => self.recycle_page(&page, &mut buf, tail_id)?,
            };

            debug!(
                "{}: took emptied tail node of bucket {} as page {}",
                self.config.name, bucket, new_id
            );
            return Ok(Some(new_id));
        }
    }

    // ------------------------------------------------------------------
    // remove / merge
    // ------------------------------------------------------------------

    /// Take a data page off the list it is registered in. The caller
    /// holds the data page's write latch.
    ///
    /// Returns false when a concurrent operation already removed the
    /// entry (the owning node was recycled, or the entry was taken).
    pub fn remove_data_page(
        &self,
        data_page: &PageSlot,
        data_buf: &mut [u8],
        bucket: usize,
    ) -> Result<bool, SmallError> {
        self.check_bucket(bucket)?;
        data_io::check_type(data_buf)?;

        let data_id = io::get_page_id(data_buf);
        let node_id = data_io::get_free_list_page_id(data_buf);
        if node_id.is_null() {
            return Err(SmallError::corrupted(&format!(
                "data page {} is not on any list",
                data_id
            )));
        }

        let node = self.pm.page(node_id)?;
        let mut node_buf = node.write();

        if io::get_page_id(&node_buf) != node_id {
            // concurrent recycle, the entry is gone already
            return Ok(false);
        }
        node_io::check_type(&node_buf)?;

        if !node_io::remove_page(&mut node_buf, data_id) {
            return Ok(false);
        }
        self.log_delta(
            &node,
            WalRecord::PagesListRemovePage {
                cache_id: self.config.cache_id,
                node_page_id: node_id,
                removed_id: data_id,
            },
        )?;
        node.set_dirty(true);

        data_io::clear_free_list_page_id(data_buf);
        self.log_delta(
            data_page,
            WalRecord::DataPageSetFreeListPage {
                cache_id: self.config.cache_id,
                data_page_id: data_id,
                free_list_page_id: NULL_PAGE_ID,
            },
        )?;
        data_page.set_dirty(true);

        if !node_io::is_empty(&node_buf) {
            return Ok(true);
        }

        // the node emptied out: try to retire it
        let next_id = node_io::get_next_id(&node_buf);
        let prev_id = node_io::get_previous_id(&node_buf);

        let recycled = if next_id.is_null() {
            // The node is the tail, so there is no next to latch first
            // and the merge can run under the latch we already hold.
            let recycled =
                self.merge_no_next(node_id, &node, &mut node_buf, prev_id, bucket)?;
            drop(node_buf);
            recycled
        } else {
            drop(node_buf);
            self.merge(node_id, next_id, bucket)?
        };

        if !recycled.is_null() {
            self.deposit_recycled(recycled)?;
        }
        Ok(true)
    }

    // The empty node is the tail of its stripe; caller holds its latch.
    fn merge_no_next(
        &self,
        node_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        prev_id: PageId,
        bucket: usize,
    ) -> Result<PageId, SmallError> {
        if self.is_reuse_bucket(bucket) {
            // empty tails are the normal resting state there
            return Ok(NULL_PAGE_ID);
        }

        if !prev_id.is_null() {
            self.cut_tail(node_id, prev_id, bucket)?;
        } else {
            // sole node of its stripe: the stripe goes away with it
            self.table.cas_remove(bucket, node_id)?;
            debug!(
                "{}: bucket {} dropped stripe with tail {}",
                self.config.name, bucket, node_id
            );
        }

        self.recycle_page(node, node_buf, node_id)
    }

    // Make `prev_id` the tail of the stripe whose tail is `node_id`.
    // Caller holds the latch on `node_id`; taking the previous page's
    // latch afterwards respects the lock order.
    fn cut_tail(&self, node_id: PageId, prev_id: PageId, bucket: usize) -> SmallResult {
        let prev_page = self.pm.page(prev_id)?;
        let mut prev_buf = prev_page.write();

        if node_io::get_next_id(&prev_buf) != node_id {
            return Err(SmallError::corrupted(&format!(
                "node {} does not link back to tail {}",
                prev_id, node_id
            )));
        }

        node_io::set_next_id(&mut prev_buf, NULL_PAGE_ID);
        self.log_delta(
            &prev_page,
            WalRecord::PagesListSetNext {
                cache_id: self.config.cache_id,
                page_id: prev_id,
                next_id: NULL_PAGE_ID,
            },
        )?;
        prev_page.set_dirty(true);

        self.table.update_tail(bucket, node_id, prev_id)
    }

    // The empty node has a successor. Latches are taken next-first in a
    // retry loop, because the chain may move while we hold nothing.
    fn merge(
        &self,
        node_id: PageId,
        mut next_id: PageId,
        bucket: usize,
    ) -> Result<PageId, SmallError> {
        let node = self.pm.page(node_id)?;

        loop {
            let next_page = self.pm.page(next_id)?;
            let mut next_buf = next_page.write();
            let mut node_buf = node.write();

            if io::get_page_id(&node_buf) != node_id {
                // someone else recycled the node, nothing left to do
                return Ok(NULL_PAGE_ID);
            }

            if !node_io::is_empty(&node_buf) {
                // the node became a tail and received entries meanwhile
                return Ok(NULL_PAGE_ID);
            }

            let cur_next = node_io::get_next_id(&node_buf);
            if cur_next != next_id {
                if cur_next.is_null() {
                    // the successors merged away underneath us
                    drop(next_buf);
                    let prev_id = node_io::get_previous_id(&node_buf);
                    return self.merge_no_next(node_id, &node, &mut node_buf, prev_id, bucket);
                }

                next_id = cur_next;
                continue;
            }

            return self.do_merge(
                node_id,
                &node,
                &mut node_buf,
                next_id,
                &next_page,
                &mut next_buf,
            );
        }
    }

    // All latches are in place: unlink the empty node and recycle it.
    fn do_merge(
        &self,
        node_id: PageId,
        node: &PageSlot,
        node_buf: &mut [u8],
        next_id: PageId,
        next_page: &PageSlot,
        next_buf: &mut [u8],
    ) -> Result<PageId, SmallError> {
        let prev_id = node_io::get_previous_id(node_buf);

        if prev_id.is_null() {
            // the node is the head: its successor becomes the head
            node_io::set_previous_id(next_buf, NULL_PAGE_ID);
            self.log_delta(
                next_page,
                WalRecord::PagesListSetPrevious {
                    cache_id: self.config.cache_id,
                    page_id: next_id,
                    previous_id: NULL_PAGE_ID,
                },
            )?;
            next_page.set_dirty(true);
        } else {
            // fair merge: bridge both neighbors over the empty node
            let prev_page = self.pm.page(prev_id)?;
            let mut prev_buf = prev_page.write();

            if node_io::get_next_id(&prev_buf) != node_id {
                return Err(SmallError::corrupted(&format!(
                    "node {} does not link forward to {}",
                    prev_id, node_id
                )));
            }

            node_io::set_next_id(&mut prev_buf, next_id);
            self.log_delta(
                &prev_page,
                WalRecord::PagesListSetNext {
                    cache_id: self.config.cache_id,
                    page_id: prev_id,
                    next_id,
                },
            )?;
            prev_page.set_dirty(true);

            node_io::set_previous_id(next_buf, prev_id);
            self.log_delta(
                next_page,
                WalRecord::PagesListSetPrevious {
                    cache_id: self.config.cache_id,
                    page_id: next_id,
                    previous_id: prev_id,
                },
            )?;
            next_page.set_dirty(true);
        }

        debug!(
            "{}: merged out empty node {} (prev {}, next {})",
            self.config.name, node_id, prev_id, next_id
        );
        self.recycle_page(node, node_buf, node_id)
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn check_bucket(&self, bucket: usize) -> SmallResult {
        if bucket >= self.config.buckets {
            return Err(SmallError::corrupted(&format!(
                "bucket {} out of range ({} buckets)",
                bucket, self.config.buckets
            )));
        }
        Ok(())
    }

    fn is_reuse_bucket(&self, bucket: usize) -> bool {
        self.config.reuse_bucket == Some(bucket)
    }

    fn random_stripe(&self, bucket: usize) -> Option<Arc<Stripe>> {
        let guard = epoch::pin();
        let stripes = self.table.load(bucket, &guard)?;
        if stripes.is_empty() {
            return None;
        }

        let i = rand::thread_rng().gen_range(0, stripes.len());
        Some(stripes[i].clone())
    }

    /// Start a new stripe in `bucket` with an empty node page.
    ///
    /// The node page comes from the reuse pool when `allow_reuse` is
    /// set, and from a direct allocation otherwise. A bag is only
    /// passed by the contention-relief growth inside `put`, so that a
    /// deposit blocked on a hot tail can feed the new stripe itself;
    /// the bootstrap stripe of an empty bucket never eats into the
    /// deposit.
    fn add_stripe(
        &self,
        bucket: usize,
        bag: Option<&mut ReuseBag>,
        allow_reuse: bool,
    ) -> Result<Arc<Stripe>, SmallError> {
        let node_id = self.allocate_node_page(bag, allow_reuse)?;

        let page = self.pm.page(node_id)?;
        {
            let mut buf = page.write();
            node_io::init_new_page(&mut buf, node_id, NULL_PAGE_ID);
            self.log_delta(
                &page,
                WalRecord::PagesListInitNewPage {
                    cache_id: self.config.cache_id,
                    page_id: node_id,
                    previous_id: NULL_PAGE_ID,
                    add_data_page_id: NULL_PAGE_ID,
                },
            )?;
            page.set_dirty(true);
        }

        let stripe = Arc::new(Stripe::new(node_id));
        self.table.cas_append(bucket, stripe.clone());

        debug!(
            "{}: bucket {} grew a stripe with tail {} ({} stripes now)",
            self.config.name,
            bucket,
            node_id,
            self.table.count(bucket)
        );
        Ok(stripe)
    }

    fn allocate_node_page(
        &self,
        bag: Option<&mut ReuseBag>,
        allow_reuse: bool,
    ) -> Result<PageId, SmallError> {
        if let Some(bag) = bag {
            if let Some(id) = bag.poll_free_page() {
                return Ok(id.with_flag(FLAG_IDX));
            }
        }

        if allow_reuse {
            let recycled = if self.config.reuse_bucket.is_some() {
                self.take_recycled_page()?
            } else if let Some(reuse_list) = &self.reuse_list {
                reuse_list.take_recycled_page()?
            } else {
                None
            };

            if let Some(id) = recycled {
                return Ok(id.with_flag(FLAG_IDX));
            }
        }

        self.pm.allocate_page(None, FLAG_IDX)
    }

    // Hand a recycled node page to whoever collects free pages: our own
    // reuse bucket when we have one, the external reuse list otherwise.
    fn deposit_recycled(&self, id: PageId) -> SmallResult {
        let mut bag = ReuseBag::singleton(id);

        if let Some(reuse_bucket) = self.config.reuse_bucket {
            return self.put_reuse_bag(&mut bag, reuse_bucket);
        }
        if let Some(reuse_list) = &self.reuse_list {
            return reuse_list.add_for_recycle(&mut bag);
        }

        warn!(
            "{}: no reuse list configured, recycled page {} is lost",
            self.config.name, id
        );
        Ok(())
    }

    // Rotate the page id in place, retiring the page. Any reference to
    // the old id becomes observably stale.
    fn recycle_page(
        &self,
        page: &PageSlot,
        buf: &mut [u8],
        old_id: PageId,
    ) -> Result<PageId, SmallError> {
        let new_id = old_id.rotated();

        io::set_page_id(buf, new_id);
        self.log_delta(
            page,
            WalRecord::Recycle {
                cache_id: self.config.cache_id,
                page_id: old_id,
                rotated_page_id: new_id,
            },
        )?;
        page.set_dirty(true);

        Ok(new_id)
    }

    // Re-initialize a retired page in place for the layout the caller
    // asked for, under a fresh rotated id.
    fn init_reused_page(
        &self,
        page: &PageSlot,
        buf: &mut [u8],
        old_id: PageId,
        io_type: u16,
        io_version: u16,
    ) -> Result<PageId, SmallError> {
        let flag = if io_type == T_DATA { FLAG_DATA } else { FLAG_IDX };
        let new_id = old_id.rotated().with_flag(flag);

        io::init_page(buf, io_type, io_version, new_id)?;
        self.log_delta(
            page,
            WalRecord::InitNewPage {
                cache_id: self.config.cache_id,
                page_id: old_id,
                io_type,
                io_version,
                new_page_id: new_id,
            },
        )?;
        page.set_dirty(true);

        Ok(new_id)
    }

    // A delta is only worth logging when the page is not due for a full
    // image anyway.
    fn log_delta(&self, page: &PageSlot, record: WalRecord) -> SmallResult {
        if let Some(wal) = &self.wal {
            if !page.full_page_wal() {
                wal.log(&record)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // introspection (used by the engine for stats and by tests)
    // ------------------------------------------------------------------

    pub fn buckets(&self) -> usize {
        self.config.buckets
    }

    pub fn reuse_bucket(&self) -> Option<usize> {
        self.config.reuse_bucket
    }

    /// Current tail ids of a bucket's stripes.
    pub fn bucket_tails(&self, bucket: usize) -> Vec<PageId> {
        self.table
            .stripes(bucket)
            .iter()
            .map(|s| s.tail_id())
            .collect()
    }

    pub fn stripe_count(&self, bucket: usize) -> usize {
        self.table.count(bucket)
    }
}

impl ReuseList for PagesList {
    fn add_for_recycle(&self, bag: &mut ReuseBag) -> SmallResult {
        let reuse_bucket = self
            .config
            .reuse_bucket
            .ok_or_else(|| SmallError::corrupted("list has no reuse bucket"))?;
        self.put_reuse_bag(bag, reuse_bucket)
    }

    fn take_recycled_page(&self) -> Result<Option<PageId>, SmallError> {
        let reuse_bucket = self
            .config
            .reuse_bucket
            .ok_or_else(|| SmallError::corrupted("list has no reuse bucket"))?;
        self.take_empty_page(reuse_bucket, None)
    }
}
