use std::fmt;
use std::io::Read;

use crate::{
    codec::{Decodeable, Encodeable},
    error::SmallError,
};

/// Flag of a page holding engine data.
pub const FLAG_DATA: u8 = 1;

/// Flag of a page holding internal structures (list nodes, list meta).
pub const FLAG_IDX: u8 = 2;

const INDEX_BITS: u64 = 32;
const FLAG_BITS: u64 = 8;
const ROTATION_BITS: u64 = 16;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;
const ROTATION_MASK: u64 = (1 << ROTATION_BITS) - 1;

const MAX_ROTATION: u64 = ROTATION_MASK;

/// A tagged 64-bit page id.
///
/// # Layout
///
/// - bits 0..32: page index (position in the backing store, 0 is
///   reserved for the null id)
/// - bits 32..40: type flag (`FLAG_DATA` / `FLAG_IDX`)
/// - bits 40..56: rotation counter
/// - bits 56..64: reserved, always zero
///
/// Rotating a page id bumps the rotation counter, which invalidates
/// every reference still carrying the old generation. This is how pages
/// are recycled without a global reference sweep.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

pub const NULL_PAGE_ID: PageId = PageId(0);

impl PageId {
    pub fn new(flag: u8, rotation: u16, index: u32) -> Self {
        PageId(
            (index as u64 & INDEX_MASK)
                | ((flag as u64 & FLAG_MASK) << INDEX_BITS)
                | ((rotation as u64 & ROTATION_MASK) << (INDEX_BITS + FLAG_BITS)),
        )
    }

    pub fn from_raw(raw: u64) -> Self {
        PageId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn index(&self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    pub fn flag(&self) -> u8 {
        ((self.0 >> INDEX_BITS) & FLAG_MASK) as u8
    }

    pub fn rotation(&self) -> u16 {
        ((self.0 >> (INDEX_BITS + FLAG_BITS)) & ROTATION_MASK) as u16
    }

    /// Bump the rotation counter. The counter wraps from its maximum
    /// back to 1, never to 0, so a rotated id is always distinct from a
    /// never-rotated one.
    pub fn rotated(&self) -> PageId {
        let rotation = self.rotation() as u64;
        let next = if rotation == MAX_ROTATION { 1 } else { rotation + 1 };
        PageId::new(self.flag(), next as u16, self.index())
    }

    /// Same index and rotation, different type flag. Used when a free
    /// page changes role (data page becomes a list node or the other way
    /// around).
    pub fn with_flag(&self, flag: u8) -> PageId {
        PageId::new(flag, self.rotation(), self.index())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            return write!(f, "null");
        }
        write!(
            f,
            "{:04x}-{}-{:08x}",
            self.rotation(),
            match self.flag() {
                FLAG_DATA => "d",
                FLAG_IDX => "i",
                _ => "?",
            },
            self.index(),
        )
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Encodeable for PageId {
    fn encode(&self) -> Vec<u8> {
        self.0.encode()
    }
}

impl Decodeable for PageId {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, SmallError> {
        Ok(PageId(u64::decode_from(reader)?))
    }
}
