pub mod btree_internal_page;
pub mod btree_leaf_page;
pub mod directory_page;
pub mod hash_block_page;
pub mod hash_header_page;

use serde::{Deserialize, Serialize};

/// Identifier of a 4KiB page in the database file.
///
/// Page 0 is reserved for the root directory, so the raw value 0 doubles as
/// the on-disk encoding of "no page" in every link field; in memory such
/// links are `Option<PageId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// The page holding the root directory of index roots.
pub const HEADER_PAGE_ID: PageId = PageId(0);

impl PageId {
    /// Decodes an on-disk link field. 0 means "no page".
    pub fn from_raw(raw: u32) -> Option<PageId> {
        if raw == 0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Encodes an optional link for an on-disk field.
    pub fn to_raw(link: Option<PageId>) -> u32 {
        link.map(|p| p.0).unwrap_or(0)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

/// Discriminates the typed views layered over raw page bytes.
///
/// A page read past the end of the file comes back all zeros; the raw tag 0
/// therefore never decodes, and callers must treat such a page as
/// uninitialized rather than wrap it in a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    Directory = 1,
    Internal = 2,
    Leaf = 3,
    HashHeader = 4,
    HashBlock = 5,
}

impl PageType {
    pub fn from_u32(raw: u32) -> Option<PageType> {
        match raw {
            1 => Some(PageType::Directory),
            2 => Some(PageType::Internal),
            3 => Some(PageType::Leaf),
            4 => Some(PageType::HashHeader),
            5 => Some(PageType::HashBlock),
            _ => None,
        }
    }

    /// Reads the tag from the first four bytes of a page.
    pub fn of_page(data: &[u8]) -> Option<PageType> {
        let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Self::from_u32(raw)
    }
}
