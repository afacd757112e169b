//! Layout of a list meta page: a chain link plus packed
//! `(bucket, tail id)` items. The meta chain is rewritten wholesale on
//! every metadata save, so there is no removal operation, only
//! `reset_count`.

use crate::{
    io::{self, COMMON_HEADER_END, T_PAGE_LIST_META},
    page::PageId,
    types::SmallResult,
};

pub const VERSION: u16 = 1;

const NEXT_META_OFF: usize = COMMON_HEADER_END;
const COUNT_OFF: usize = NEXT_META_OFF + 8;
const ITEMS_OFF: usize = COUNT_OFF + 8;

const ITEM_SIZE: usize = 2 + 8;

/// Items a meta page can hold for the given page size.
pub fn capacity(page_size: usize) -> usize {
    (page_size - ITEMS_OFF) / ITEM_SIZE
}

pub fn init_new_page(buf: &mut [u8], id: PageId) {
    io::init_header(buf, T_PAGE_LIST_META, VERSION, id);
    io::write_u64(buf, NEXT_META_OFF, 0);
    io::write_u16(buf, COUNT_OFF, 0);
    for b in buf[COUNT_OFF + 2..].iter_mut() {
        *b = 0;
    }
}

pub fn check_type(buf: &[u8]) -> SmallResult {
    io::check_type(buf, T_PAGE_LIST_META, VERSION)
}

pub fn get_next_meta_page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(io::read_u64(buf, NEXT_META_OFF))
}

pub fn set_next_meta_page_id(buf: &mut [u8], next: PageId) {
    io::write_u64(buf, NEXT_META_OFF, next.raw());
}

pub fn get_count(buf: &[u8]) -> usize {
    io::read_u16(buf, COUNT_OFF) as usize
}

pub fn reset_count(buf: &mut [u8]) {
    io::write_u16(buf, COUNT_OFF, 0);
}

/// Append one `(bucket, tail)` item. Returns false when the page is
/// full and the caller has to move to the next page of the chain.
pub fn add_item(buf: &mut [u8], bucket: u16, tail: PageId) -> bool {
    let count = get_count(buf);
    if count >= capacity(buf.len()) {
        return false;
    }

    let off = ITEMS_OFF + count * ITEM_SIZE;
    io::write_u16(buf, off, bucket);
    io::write_u64(buf, off + 2, tail.raw());
    io::write_u16(buf, COUNT_OFF, (count + 1) as u16);
    true
}

pub fn items(buf: &[u8]) -> Vec<(u16, PageId)> {
    (0..get_count(buf))
        .map(|i| {
            let off = ITEMS_OFF + i * ITEM_SIZE;
            (
                io::read_u16(buf, off),
                PageId::from_raw(io::read_u64(buf, off + 2)),
            )
        })
        .collect()
}
