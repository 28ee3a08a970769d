//! Slot codecs for inner and leaf pages.
//!
//! Inner slot layout:
//! ```text
//! child_pgid (4) || strict_upper_bound key (variable)
//! ```
//! The key length is deduced from the slot length, so it is not stored.
//!
//! Leaf slot layout:
//! ```text
//! key_len (2, PageOffset) || key || value
//! ```
//! The value length is deduced: `slot_len - 2 - key_len`.

use bytes::{BufMut, Bytes, BytesMut};

use bramble_common::page::{PageId, PageOffset};

/// Parsed inner slot: a child pointer plus the strict upper bound of every
/// key in the child's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerSlot<'a> {
    /// The child page in this slot.
    pub child: PageId,
    /// All keys in the child's subtree compare strictly less than this.
    pub upper_bound: &'a [u8],
}

impl<'a> InnerSlot<'a> {
    /// Parses the content of an on-disk inner slot. The returned view
    /// borrows from `slot` and is invalidated by any mutation of the page.
    pub fn parse(slot: &'a [u8]) -> Self {
        debug_assert!(slot.len() >= PageId::SIZE);
        Self {
            child: PageId::from_bytes(&slot[..PageId::SIZE]),
            upper_bound: &slot[PageId::SIZE..],
        }
    }

    /// Size of this slot in on-disk format.
    pub fn encoded_len(&self) -> usize {
        PageId::SIZE + self.upper_bound.len()
    }

    /// Serializes to on-disk format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.child.to_bytes());
        buf.put_slice(self.upper_bound);
        buf.freeze()
    }
}

/// Parsed leaf slot: one key/value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSlot<'a> {
    /// The key bytes.
    pub key: &'a [u8],
    /// The value bytes.
    pub value: &'a [u8],
}

impl<'a> LeafSlot<'a> {
    /// Size of the key-length prefix.
    const PREFIX: usize = std::mem::size_of::<PageOffset>();

    /// Parses the content of an on-disk leaf slot. The returned views
    /// borrow from `slot` and are invalidated by any mutation of the page.
    pub fn parse(slot: &'a [u8]) -> Self {
        debug_assert!(slot.len() >= Self::PREFIX);
        let key_len = PageOffset::from_le_bytes([slot[0], slot[1]]) as usize;
        debug_assert!(Self::PREFIX + key_len <= slot.len());
        Self {
            key: &slot[Self::PREFIX..Self::PREFIX + key_len],
            value: &slot[Self::PREFIX + key_len..],
        }
    }

    /// Size of this slot in on-disk format.
    pub fn encoded_len(&self) -> usize {
        Self::PREFIX + self.key.len() + self.value.len()
    }

    /// Serializes to on-disk format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&(self.key.len() as PageOffset).to_le_bytes());
        buf.put_slice(self.key);
        buf.put_slice(self.value);
        buf.freeze()
    }
}
