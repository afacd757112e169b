//! The per-bucket stripe table.
//!
//! Each bucket slot holds a pointer to an immutable array of stripes.
//! Structural changes (adding a stripe, dropping a drained stripe,
//! installing restored stripes) replace the whole array through a CAS;
//! readers pin an epoch guard and may observe the old or the new array.
//! A `Stripe` is identity-stable: the same `Arc` is carried into every
//! successor array, so a reader holding one keeps a meaningful tail
//! handle across replacements.
//!
//! The only mutable field, `tail_id`, is written in place, and only by
//! the thread holding the write latch on the old tail page; that latch,
//! not the CAS, serializes tail movement.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::{error::SmallError, page::PageId, types::SmallResult};

pub struct Stripe {
    tail_id: AtomicU64,
}

impl Stripe {
    pub fn new(tail: PageId) -> Self {
        Self {
            tail_id: AtomicU64::new(tail.raw()),
        }
    }

    pub fn tail_id(&self) -> PageId {
        PageId::from_raw(self.tail_id.load(Ordering::Acquire))
    }

    // Caller must hold the write latch on the page `tail_id` currently
    // points at.
    pub(crate) fn set_tail_id(&self, id: PageId) {
        self.tail_id.store(id.raw(), Ordering::Release);
    }
}

pub(crate) struct BucketTable {
    slots: Box<[Atomic<Vec<Arc<Stripe>>>]>,
}

impl BucketTable {
    pub fn new(buckets: usize) -> Self {
        Self {
            slots: (0..buckets)
                .map(|_| Atomic::null())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    pub fn load<'g>(
        &self,
        bucket: usize,
        guard: &'g Guard,
    ) -> Option<&'g Vec<Arc<Stripe>>> {
        let shared = self.slots[bucket].load(Ordering::Acquire, guard);
        unsafe { shared.as_ref() }
    }

    /// A cloned snapshot of the bucket's stripes.
    pub fn stripes(&self, bucket: usize) -> Vec<Arc<Stripe>> {
        let guard = epoch::pin();
        self.load(bucket, &guard).cloned().unwrap_or_default()
    }

    pub fn count(&self, bucket: usize) -> usize {
        let guard = epoch::pin();
        self.load(bucket, &guard).map(|v| v.len()).unwrap_or(0)
    }

    /// Publish a new stripe, retrying until the CAS lands.
    pub fn cas_append(&self, bucket: usize, stripe: Arc<Stripe>) {
        let guard = epoch::pin();
        loop {
            let cur = self.slots[bucket].load(Ordering::Acquire, &guard);
            let mut vec = unsafe { cur.as_ref() }.cloned().unwrap_or_default();
            vec.push(stripe.clone());

            match self.slots[bucket].compare_exchange(
                cur,
                Owned::new(vec),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if !cur.is_null() {
                        unsafe { guard.defer_destroy(cur) };
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Install the restored stripe set of a bucket. Only legal while
    /// the slot is still null (a freshly constructed list).
    pub fn cas_install(&self, bucket: usize, stripes: Vec<Arc<Stripe>>) -> SmallResult {
        let guard = epoch::pin();
        let cur = self.slots[bucket].load(Ordering::Acquire, &guard);
        if !cur.is_null() {
            return Err(SmallError::corrupted("bucket stripes already installed"));
        }

        self.slots[bucket]
            .compare_exchange(
                cur,
                Owned::new(stripes),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            )
            .map(|_| ())
            .map_err(|_| SmallError::corrupted("bucket stripes already installed"))
    }

    /// Remove the stripe whose tail is `old_tail` (the caller holds
    /// that tail's write latch, so the stripe cannot move under us).
    pub fn cas_remove(&self, bucket: usize, old_tail: PageId) -> SmallResult {
        let guard = epoch::pin();
        loop {
            let cur = self.slots[bucket].load(Ordering::Acquire, &guard);
            let vec = unsafe { cur.as_ref() }.ok_or_else(|| {
                SmallError::corrupted(&format!("stripe with tail {} not found", old_tail))
            })?;
            let idx = vec
                .iter()
                .position(|s| s.tail_id() == old_tail)
                .ok_or_else(|| {
                    SmallError::corrupted(&format!(
                        "stripe with tail {} not found",
                        old_tail
                    ))
                })?;

            if vec.len() == 1 {
                match self.slots[bucket].compare_exchange(
                    cur,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => {
                        unsafe { guard.defer_destroy(cur) };
                        return Ok(());
                    }
                    Err(_) => continue,
                }
            } else {
                let mut smaller = vec.clone();
                smaller.remove(idx);

                match self.slots[bucket].compare_exchange(
                    cur,
                    Owned::new(smaller),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => {
                        unsafe { guard.defer_destroy(cur) };
                        return Ok(());
                    }
                    // the rejected array is handed back and dropped here
                    Err(_) => continue,
                }
            }
        }
    }

    /// Move a stripe's tail in place. No CAS: the write latch on the
    /// old tail page serializes this against every other tail move.
    pub fn update_tail(
        &self,
        bucket: usize,
        old_tail: PageId,
        new_tail: PageId,
    ) -> SmallResult {
        let guard = epoch::pin();
        let vec = self.load(bucket, &guard).ok_or_else(|| {
            SmallError::corrupted(&format!("stripe with tail {} not found", old_tail))
        })?;
        let stripe = vec
            .iter()
            .find(|s| s.tail_id() == old_tail)
            .ok_or_else(|| {
                SmallError::corrupted(&format!("stripe with tail {} not found", old_tail))
            })?;

        stripe.set_tail_id(new_tail);
        Ok(())
    }
}

impl Drop for BucketTable {
    fn drop(&mut self) {
        // no concurrent access is possible here, reclaim directly
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let cur = slot.load(Ordering::Relaxed, guard);
            if !cur.is_null() {
                drop(unsafe { cur.into_owned() });
            }
        }
    }
}
