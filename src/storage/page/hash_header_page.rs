use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageType};
use crate::storage::PAGE_SIZE;

const SIZE_OFFSET: usize = 4;
const NUM_BLOCKS_OFFSET: usize = 8;
const BLOCK_IDS_OFFSET: usize = 12;
const MAX_BLOCKS: usize = (PAGE_SIZE - BLOCK_IDS_OFFSET) / 4;

/// Owned view over a hash table header page: the table's total slot count
/// plus the ordered list of block page ids.
pub struct HashHeaderPage {
    data: [u8; PAGE_SIZE],
}

impl HashHeaderPage {
    pub fn new() -> Self {
        let mut page = Self {
            data: [0; PAGE_SIZE],
        };
        page.data[0..4].copy_from_slice(&(PageType::HashHeader as u32).to_le_bytes());
        page
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        match PageType::of_page(data) {
            Some(PageType::HashHeader) => Ok(Self { data: *data }),
            other => Err(StorageError::InvalidPageType {
                expected: "HashHeader",
                found: other.map(|t| t as u32).unwrap_or(0),
            }),
        }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    fn set_u32(&mut self, offset: usize, val: u32) {
        self.data[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Total number of slots across all blocks.
    pub fn size(&self) -> usize {
        self.get_u32(SIZE_OFFSET) as usize
    }

    pub fn set_size(&mut self, size: usize) {
        self.set_u32(SIZE_OFFSET, size as u32);
    }

    pub fn num_blocks(&self) -> usize {
        self.get_u32(NUM_BLOCKS_OFFSET) as usize
    }

    pub fn block_page_id(&self, index: usize) -> PageId {
        assert!(index < self.num_blocks(), "block index {} out of range", index);
        PageId(self.get_u32(BLOCK_IDS_OFFSET + index * 4))
    }

    pub fn block_page_ids(&self) -> Vec<PageId> {
        (0..self.num_blocks()).map(|i| self.block_page_id(i)).collect()
    }

    /// Appends a block page id.
    pub fn add_block_page_id(&mut self, page_id: PageId) -> StorageResult<()> {
        let n = self.num_blocks();
        if n >= MAX_BLOCKS {
            return Err(StorageError::DirectoryFull);
        }
        self.set_u32(BLOCK_IDS_OFFSET + n * 4, page_id.0);
        self.set_u32(NUM_BLOCKS_OFFSET, (n + 1) as u32);
        Ok(())
    }
}

impl Default for HashHeaderPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_is_empty() {
        let page = HashHeaderPage::new();
        assert_eq!(page.size(), 0);
        assert_eq!(page.num_blocks(), 0);
    }

    #[test]
    fn test_add_and_get_blocks() {
        let mut page = HashHeaderPage::new();
        page.add_block_page_id(PageId(3)).unwrap();
        page.add_block_page_id(PageId(4)).unwrap();
        page.set_size(512);

        assert_eq!(page.num_blocks(), 2);
        assert_eq!(page.block_page_id(0), PageId(3));
        assert_eq!(page.block_page_id(1), PageId(4));
        assert_eq!(page.block_page_ids(), vec![PageId(3), PageId(4)]);
        assert_eq!(page.size(), 512);
    }

    #[test]
    fn test_roundtrip_through_bytes() {
        let mut page = HashHeaderPage::new();
        page.add_block_page_id(PageId(7)).unwrap();
        page.set_size(256);

        let reopened = HashHeaderPage::from_data(page.data()).unwrap();
        assert_eq!(reopened.block_page_id(0), PageId(7));
        assert_eq!(reopened.size(), 256);
    }

    #[test]
    fn test_zeroed_page_rejected() {
        assert!(HashHeaderPage::from_data(&[0u8; PAGE_SIZE]).is_err());
    }
}
