//! The slice of the data page layout this crate owns: the back-pointer
//! to the list node page that currently lists the data page. Record
//! storage beyond the header belongs to the engine.

use crate::{
    io::{self, COMMON_HEADER_END, T_DATA},
    page::{PageId, NULL_PAGE_ID},
    types::SmallResult,
};

pub const VERSION: u16 = 1;

const FREE_LIST_OFF: usize = COMMON_HEADER_END;

pub fn init_new_page(buf: &mut [u8], id: PageId) {
    io::init_header(buf, T_DATA, VERSION, id);
    for b in buf[COMMON_HEADER_END..].iter_mut() {
        *b = 0;
    }
}

pub fn check_type(buf: &[u8]) -> SmallResult {
    io::check_type(buf, T_DATA, VERSION)
}

/// The node page listing this data page, or the null id when the page
/// is not on any list.
pub fn get_free_list_page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(io::read_u64(buf, FREE_LIST_OFF))
}

pub fn set_free_list_page_id(buf: &mut [u8], node: PageId) {
    io::write_u64(buf, FREE_LIST_OFF, node.raw());
}

pub fn clear_free_list_page_id(buf: &mut [u8]) {
    set_free_list_page_id(buf, NULL_PAGE_ID);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{FLAG_DATA, FLAG_IDX};

    #[test]
    fn test_back_pointer_round_trip() {
        let mut buf = vec![0; 64];
        init_new_page(&mut buf, PageId::new(FLAG_DATA, 0, 4));

        assert!(get_free_list_page_id(&buf).is_null());

        let node = PageId::new(FLAG_IDX, 1, 2);
        set_free_list_page_id(&mut buf, node);
        assert_eq!(get_free_list_page_id(&buf), node);

        clear_free_list_page_id(&mut buf);
        assert!(get_free_list_page_id(&buf).is_null());
    }
}
