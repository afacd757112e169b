//! Redo records for list mutations.
//!
//! Every in-place page mutation emits one record describing just the
//! delta, so recovery can rebuild a page from its last full image plus
//! the records logged after it. Each record knows how to re-apply
//! itself to the target page buffer; applying records in log order to a
//! pre-mutation image reproduces the page byte for byte.

use std::io::Read;

use crate::{
    codec::{read_into, Decodeable, Encodeable, SmallWriter},
    error::SmallError,
    io::{self, data_io, node_io},
    page::PageId,
    types::SmallResult,
};

const T_INIT_NEW_PAGE: u8 = 1;
const T_LIST_INIT_NEW_PAGE: u8 = 2;
const T_LIST_ADD_PAGE: u8 = 3;
const T_LIST_REMOVE_PAGE: u8 = 4;
const T_LIST_SET_NEXT: u8 = 5;
const T_LIST_SET_PREVIOUS: u8 = 6;
const T_DATA_SET_FREE_LIST_PAGE: u8 = 7;
const T_RECYCLE: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A page was re-initialized in place under a new id and layout.
    InitNewPage {
        cache_id: u32,
        page_id: PageId,
        io_type: u16,
        io_version: u16,
        new_page_id: PageId,
    },

    /// A page became a list node, optionally seeded with one data page.
    PagesListInitNewPage {
        cache_id: u32,
        page_id: PageId,
        previous_id: PageId,
        add_data_page_id: PageId,
    },

    /// A page id was appended to a node's payload.
    PagesListAddPage {
        cache_id: u32,
        node_page_id: PageId,
        added_id: PageId,
    },

    /// A page id was removed from a node's payload.
    PagesListRemovePage {
        cache_id: u32,
        node_page_id: PageId,
        removed_id: PageId,
    },

    PagesListSetNext {
        cache_id: u32,
        page_id: PageId,
        next_id: PageId,
    },

    PagesListSetPrevious {
        cache_id: u32,
        page_id: PageId,
        previous_id: PageId,
    },

    /// The back-pointer of a data page changed.
    DataPageSetFreeListPage {
        cache_id: u32,
        data_page_id: PageId,
        free_list_page_id: PageId,
    },

    /// A page id was rotated, retiring the page to the reuse pool.
    Recycle {
        cache_id: u32,
        page_id: PageId,
        rotated_page_id: PageId,
    },
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            WalRecord::InitNewPage { .. } => T_INIT_NEW_PAGE,
            WalRecord::PagesListInitNewPage { .. } => T_LIST_INIT_NEW_PAGE,
            WalRecord::PagesListAddPage { .. } => T_LIST_ADD_PAGE,
            WalRecord::PagesListRemovePage { .. } => T_LIST_REMOVE_PAGE,
            WalRecord::PagesListSetNext { .. } => T_LIST_SET_NEXT,
            WalRecord::PagesListSetPrevious { .. } => T_LIST_SET_PREVIOUS,
            WalRecord::DataPageSetFreeListPage { .. } => T_DATA_SET_FREE_LIST_PAGE,
            WalRecord::Recycle { .. } => T_RECYCLE,
        }
    }

    /// The page this record mutates. Replay latches this page and calls
    /// `apply` on its buffer.
    pub fn target_page_id(&self) -> PageId {
        match *self {
            WalRecord::InitNewPage { page_id, .. } => page_id,
            WalRecord::PagesListInitNewPage { page_id, .. } => page_id,
            WalRecord::PagesListAddPage { node_page_id, .. } => node_page_id,
            WalRecord::PagesListRemovePage { node_page_id, .. } => node_page_id,
            WalRecord::PagesListSetNext { page_id, .. } => page_id,
            WalRecord::PagesListSetPrevious { page_id, .. } => page_id,
            WalRecord::DataPageSetFreeListPage { data_page_id, .. } => data_page_id,
            WalRecord::Recycle { page_id, .. } => page_id,
        }
    }

    /// Redo this record against the target page buffer.
    pub fn apply(&self, buf: &mut [u8]) -> SmallResult {
        match *self {
            WalRecord::InitNewPage {
                io_type,
                io_version,
                new_page_id,
                ..
            } => io::init_page(buf, io_type, io_version, new_page_id),
            WalRecord::PagesListInitNewPage {
                page_id,
                previous_id,
                add_data_page_id,
                ..
            } => {
                node_io::init_new_page(buf, page_id, previous_id);
                if !add_data_page_id.is_null() {
                    node_io::add_page(buf, add_data_page_id).ok_or_else(|| {
                        SmallError::corrupted("replay: fresh node rejected its first page")
                    })?;
                }
                Ok(())
            }
            WalRecord::PagesListAddPage { added_id, .. } => {
                node_io::add_page(buf, added_id)
                    .ok_or_else(|| SmallError::corrupted("replay: add into a full node"))?;
                Ok(())
            }
            WalRecord::PagesListRemovePage { removed_id, .. } => {
                if !node_io::remove_page(buf, removed_id) {
                    return Err(SmallError::corrupted(
                        "replay: removed id not present in node",
                    ));
                }
                Ok(())
            }
            WalRecord::PagesListSetNext { next_id, .. } => {
                node_io::set_next_id(buf, next_id);
                Ok(())
            }
            WalRecord::PagesListSetPrevious { previous_id, .. } => {
                node_io::set_previous_id(buf, previous_id);
                Ok(())
            }
            WalRecord::DataPageSetFreeListPage {
                free_list_page_id, ..
            } => {
                data_io::set_free_list_page_id(buf, free_list_page_id);
                Ok(())
            }
            WalRecord::Recycle {
                rotated_page_id, ..
            } => {
                io::set_page_id(buf, rotated_page_id);
                Ok(())
            }
        }
    }
}

impl Encodeable for WalRecord {
    fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&self.record_type());

        match *self {
            WalRecord::InitNewPage {
                cache_id,
                page_id,
                io_type,
                io_version,
                new_page_id,
            } => {
                writer.write(&cache_id);
                writer.write(&page_id);
                writer.write(&io_type);
                writer.write(&io_version);
                writer.write(&new_page_id);
            }
            WalRecord::PagesListInitNewPage {
                cache_id,
                page_id,
                previous_id,
                add_data_page_id,
            } => {
                writer.write(&cache_id);
                writer.write(&page_id);
                writer.write(&previous_id);
                writer.write(&add_data_page_id);
            }
            WalRecord::PagesListAddPage {
                cache_id,
                node_page_id,
                added_id,
            } => {
                writer.write(&cache_id);
                writer.write(&node_page_id);
                writer.write(&added_id);
            }
            WalRecord::PagesListRemovePage {
                cache_id,
                node_page_id,
                removed_id,
            } => {
                writer.write(&cache_id);
                writer.write(&node_page_id);
                writer.write(&removed_id);
            }
            WalRecord::PagesListSetNext {
                cache_id,
                page_id,
                next_id,
            } => {
                writer.write(&cache_id);
                writer.write(&page_id);
                writer.write(&next_id);
            }
            WalRecord::PagesListSetPrevious {
                cache_id,
                page_id,
                previous_id,
            } => {
                writer.write(&cache_id);
                writer.write(&page_id);
                writer.write(&previous_id);
            }
            WalRecord::DataPageSetFreeListPage {
                cache_id,
                data_page_id,
                free_list_page_id,
            } => {
                writer.write(&cache_id);
                writer.write(&data_page_id);
                writer.write(&free_list_page_id);
            }
            WalRecord::Recycle {
                cache_id,
                page_id,
                rotated_page_id,
            } => {
                writer.write(&cache_id);
                writer.write(&page_id);
                writer.write(&rotated_page_id);
            }
        }

        writer.to_bytes()
    }
}

impl Decodeable for WalRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, SmallError> {
        let record_type: u8 = read_into(reader)?;

        match record_type {
            T_INIT_NEW_PAGE => Ok(WalRecord::InitNewPage {
                cache_id: read_into(reader)?,
                page_id: read_into(reader)?,
                io_type: read_into(reader)?,
                io_version: read_into(reader)?,
                new_page_id: read_into(reader)?,
            }),
            T_LIST_INIT_NEW_PAGE => Ok(WalRecord::PagesListInitNewPage {
                cache_id: read_into(reader)?,
                page_id: read_into(reader)?,
                previous_id: read_into(reader)?,
                add_data_page_id: read_into(reader)?,
            }),
            T_LIST_ADD_PAGE => Ok(WalRecord::PagesListAddPage {
                cache_id: read_into(reader)?,
                node_page_id: read_into(reader)?,
                added_id: read_into(reader)?,
            }),
            T_LIST_REMOVE_PAGE => Ok(WalRecord::PagesListRemovePage {
                cache_id: read_into(reader)?,
                node_page_id: read_into(reader)?,
                removed_id: read_into(reader)?,
            }),
            T_LIST_SET_NEXT => Ok(WalRecord::PagesListSetNext {
                cache_id: read_into(reader)?,
                page_id: read_into(reader)?,
                next_id: read_into(reader)?,
            }),
            T_LIST_SET_PREVIOUS => Ok(WalRecord::PagesListSetPrevious {
                cache_id: read_into(reader)?,
                page_id: read_into(reader)?,
                previous_id: read_into(reader)?,
            }),
            T_DATA_SET_FREE_LIST_PAGE => Ok(WalRecord::DataPageSetFreeListPage {
                cache_id: read_into(reader)?,
                data_page_id: read_into(reader)?,
                free_list_page_id: read_into(reader)?,
            }),
            T_RECYCLE => Ok(WalRecord::Recycle {
                cache_id: read_into(reader)?,
                page_id: read_into(reader)?,
                rotated_page_id: read_into(reader)?,
            }),
            _ => Err(SmallError::corrupted(&format!(
                "invalid record type: {}",
                record_type
            ))),
        }
    }
}
