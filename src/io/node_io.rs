//! Layout of a list node page: prev/next links plus an array of page
//! ids. Insertions go at the end, removals move the last id into the
//! hole, so the occupied prefix is always dense and vacated slots are
//! zeroed.

use crate::{
    io::{self, COMMON_HEADER_END, T_PAGE_LIST_NODE},
    page::{PageId, NULL_PAGE_ID},
    types::SmallResult,
};

pub const VERSION: u16 = 1;

const PREV_OFF: usize = COMMON_HEADER_END;
const NEXT_OFF: usize = PREV_OFF + 8;
const COUNT_OFF: usize = NEXT_OFF + 8;

// count is followed by 6 bytes of padding so the id array is 8-aligned
const IDS_OFF: usize = COUNT_OFF + 8;

/// Ids a node page can hold for the given page size.
pub fn capacity(page_size: usize) -> usize {
    (page_size - IDS_OFF) / 8
}

pub fn init_new_page(buf: &mut [u8], id: PageId, prev: PageId) {
    io::init_header(buf, T_PAGE_LIST_NODE, VERSION, id);
    io::write_u64(buf, PREV_OFF, prev.raw());
    io::write_u64(buf, NEXT_OFF, 0);
    io::write_u16(buf, COUNT_OFF, 0);
    for b in buf[COUNT_OFF + 2..].iter_mut() {
        *b = 0;
    }
}

pub fn check_type(buf: &[u8]) -> SmallResult {
    io::check_type(buf, T_PAGE_LIST_NODE, VERSION)
}

pub fn get_previous_id(buf: &[u8]) -> PageId {
    PageId::from_raw(io::read_u64(buf, PREV_OFF))
}

pub fn set_previous_id(buf: &mut [u8], prev: PageId) {
    io::write_u64(buf, PREV_OFF, prev.raw());
}

pub fn get_next_id(buf: &[u8]) -> PageId {
    PageId::from_raw(io::read_u64(buf, NEXT_OFF))
}

pub fn set_next_id(buf: &mut [u8], next: PageId) {
    io::write_u64(buf, NEXT_OFF, next.raw());
}

pub fn get_count(buf: &[u8]) -> usize {
    io::read_u16(buf, COUNT_OFF) as usize
}

pub fn is_empty(buf: &[u8]) -> bool {
    get_count(buf) == 0
}

fn set_count(buf: &mut [u8], count: usize) {
    io::write_u16(buf, COUNT_OFF, count as u16);
}

fn get_id_at(buf: &[u8], slot: usize) -> PageId {
    PageId::from_raw(io::read_u64(buf, IDS_OFF + slot * 8))
}

fn set_id_at(buf: &mut [u8], slot: usize, id: PageId) {
    io::write_u64(buf, IDS_OFF + slot * 8, id.raw());
}

/// Append `id` to the payload. Returns the slot it went into, or `None`
/// when the node is full.
pub fn add_page(buf: &mut [u8], id: PageId) -> Option<usize> {
    let count = get_count(buf);
    if count >= capacity(buf.len()) {
        return None;
    }

    set_id_at(buf, count, id);
    set_count(buf, count + 1);
    Some(count)
}

/// Take some id out of the payload (the last one). Returns the null id
/// when the node is empty.
pub fn take_any_page(buf: &mut [u8]) -> PageId {
    let count = get_count(buf);
    if count == 0 {
        return NULL_PAGE_ID;
    }

    let id = get_id_at(buf, count - 1);
    set_id_at(buf, count - 1, NULL_PAGE_ID);
    set_count(buf, count - 1);
    id
}

/// Remove a specific id. Returns false when the id is not present (it
/// was taken or removed concurrently before we latched the page).
pub fn remove_page(buf: &mut [u8], id: PageId) -> bool {
    let count = get_count(buf);
    for slot in 0..count {
        if get_id_at(buf, slot) == id {
            let last = get_id_at(buf, count - 1);
            set_id_at(buf, slot, last);
            set_id_at(buf, count - 1, NULL_PAGE_ID);
            set_count(buf, count - 1);
            return true;
        }
    }

    false
}

/// All ids currently stored in the node, in slot order.
pub fn pages(buf: &[u8]) -> Vec<PageId> {
    (0..get_count(buf)).map(|slot| get_id_at(buf, slot)).collect()
}
