//! Page identifiers and layout constants for BrambleDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Offset type within a page. Slot lengths and in-page offsets fit in 16 bits.
pub type PageOffset = u16;

/// Unique identifier for a page within the data file.
///
/// Page 0 is reserved for the page manager header, so `PageId(0)` doubles as
/// the null sentinel in sibling/child links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Size of a serialized page id in bytes.
    pub const SIZE: usize = 4;

    /// The null page id (also the reserved header page).
    pub const NULL: PageId = PageId(0);

    /// Creates a new PageId.
    pub fn new(page_num: u32) -> Self {
        Self(page_num)
    }

    /// Returns true if this is the null sentinel.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Serializes the page id to little-endian bytes.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    /// Deserializes a page id from little-endian bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
