//! Binary page layouts.
//!
//! Every page starts with a common header; the payload after
//! `COMMON_HEADER_END` belongs to the concrete IO module. All fields are
//! little-endian. IO modules are version-tagged: they write the latest
//! version and accept every version from 1 up to it.

pub mod data_io;
pub mod meta_io;
pub mod node_io;

use std::convert::TryInto;

use crate::{error::SmallError, page::PageId, types::SmallResult};

/// Page type of engine data pages.
pub const T_DATA: u16 = 1;

/// Page type of list node pages.
pub const T_PAGE_LIST_NODE: u16 = 2;

/// Page type of list meta pages.
pub const T_PAGE_LIST_META: u16 = 3;

// Common header layout:
// - 2 bytes: io type
// - 2 bytes: io version
// - 4 bytes: crc (reserved, zero)
// - 8 bytes: page id
// - 8 bytes: reserved
const TYPE_OFF: usize = 0;
const VERSION_OFF: usize = 2;
const PAGE_ID_OFF: usize = 8;

pub const COMMON_HEADER_END: usize = 24;

pub fn get_type(buf: &[u8]) -> u16 {
    read_u16(buf, TYPE_OFF)
}

pub fn get_version(buf: &[u8]) -> u16 {
    read_u16(buf, VERSION_OFF)
}

pub fn get_page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(read_u64(buf, PAGE_ID_OFF))
}

pub fn set_page_id(buf: &mut [u8], id: PageId) {
    write_u64(buf, PAGE_ID_OFF, id.raw());
}

/// Write a fresh common header. The whole buffer past the header is left
/// to the concrete IO module.
pub fn init_header(buf: &mut [u8], io_type: u16, io_version: u16, id: PageId) {
    write_u16(buf, TYPE_OFF, io_type);
    write_u16(buf, VERSION_OFF, io_version);
    write_u32(buf, 4, 0);
    write_u64(buf, PAGE_ID_OFF, id.raw());
    write_u64(buf, 16, 0);
}

/// Check that a latched page carries the expected type and a readable
/// version. A mismatch means the caller followed a stale id into a page
/// that was recycled into something else, or the store is corrupted.
pub fn check_type(buf: &[u8], expected: u16, latest_version: u16) -> SmallResult {
    let actual = get_type(buf);
    if actual != expected {
        return Err(SmallError::corrupted(&format!(
            "unexpected page type: {} (expected {})",
            actual, expected
        )));
    }

    let version = get_version(buf);
    if version == 0 || version > latest_version {
        return Err(SmallError::corrupted(&format!(
            "unreadable page version: {} (latest {})",
            version, latest_version
        )));
    }

    Ok(())
}

/// IO-layout registry: initialize a page buffer for the given type and
/// version. Used when replaying `InitNewPage` records and when a taken
/// page is re-initialized in place.
pub fn init_page(
    buf: &mut [u8],
    io_type: u16,
    io_version: u16,
    id: PageId,
) -> SmallResult {
    match (io_type, io_version) {
        (T_DATA, data_io::VERSION) => {
            data_io::init_new_page(buf, id);
            Ok(())
        }
        (T_PAGE_LIST_NODE, node_io::VERSION) => {
            node_io::init_new_page(buf, id, crate::page::NULL_PAGE_ID);
            Ok(())
        }
        (T_PAGE_LIST_META, meta_io::VERSION) => {
            meta_io::init_new_page(buf, id);
            Ok(())
        }
        _ => Err(SmallError::corrupted(&format!(
            "unknown page io: type {}, version {}",
            io_type, io_version
        ))),
    }
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
