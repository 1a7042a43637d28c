//! The root directory page.
//!
//! Page 0 persists one record per index: a short printable name mapped to
//! the index's root page id (0 while the index is empty). Indexes look
//! themselves up here on open, so they survive restarts.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageType};
use crate::storage::PAGE_SIZE;

const RECORD_COUNT_OFFSET: usize = 4;
const RECORDS_OFFSET: usize = 8;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// Owned view over the root directory page's bytes.
///
/// Mutations happen on the copy; callers write `data()` back through their
/// page guard. A zeroed page (fresh file) is initialized in place.
pub struct DirectoryPage {
    data: [u8; PAGE_SIZE],
}

impl DirectoryPage {
    /// Wraps raw page bytes, initializing the header if the page is fresh.
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let mut page = Self { data: *data };
        match PageType::of_page(&page.data) {
            Some(PageType::Directory) => Ok(page),
            None if page.data.iter().all(|&b| b == 0) => {
                page.data[0..4].copy_from_slice(&(PageType::Directory as u32).to_le_bytes());
                Ok(page)
            }
            other => Err(StorageError::InvalidPageType {
                expected: "Directory",
                found: other.map(|t| t as u32).unwrap_or_else(|| {
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
                }),
            }),
        }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn record_count(&self) -> usize {
        u32::from_le_bytes([
            self.data[RECORD_COUNT_OFFSET],
            self.data[RECORD_COUNT_OFFSET + 1],
            self.data[RECORD_COUNT_OFFSET + 2],
            self.data[RECORD_COUNT_OFFSET + 3],
        ]) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(&self, index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let name = &self.data[offset..offset + NAME_SIZE];
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &name[..end]
    }

    fn root_at(&self, index: usize) -> u32 {
        let offset = Self::record_offset(index) + NAME_SIZE;
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    fn find(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name.as_bytes())
    }

    /// Looks up the root page id recorded under `name`. `Some(None)` means
    /// the record exists but its index is currently empty.
    pub fn get_root_id(&self, name: &str) -> Option<Option<PageId>> {
        self.find(name).map(|i| PageId::from_raw(self.root_at(i)))
    }

    /// Adds a record. Fails if the name is taken, too long, or the page is
    /// full.
    pub fn insert_record(&mut self, name: &str, root: Option<PageId>) -> StorageResult<()> {
        if name.len() > NAME_SIZE {
            return Err(StorageError::NameTooLong(name.to_string()));
        }
        if self.find(name).is_some() {
            return Err(StorageError::RecordExists(name.to_string()));
        }
        let count = self.record_count();
        if count >= MAX_RECORDS {
            return Err(StorageError::DirectoryFull);
        }

        let offset = Self::record_offset(count);
        self.data[offset..offset + NAME_SIZE].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
            .copy_from_slice(&PageId::to_raw(root).to_le_bytes());
        self.set_record_count(count + 1);
        Ok(())
    }

    /// Rewrites the root page id of an existing record.
    pub fn update_record(&mut self, name: &str, root: Option<PageId>) -> StorageResult<()> {
        let index = self
            .find(name)
            .ok_or_else(|| StorageError::RecordNotFound(name.to_string()))?;
        let offset = Self::record_offset(index) + NAME_SIZE;
        self.data[offset..offset + 4].copy_from_slice(&PageId::to_raw(root).to_le_bytes());
        Ok(())
    }

    /// Removes a record, compacting the tail. Returns false if absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };
        let count = self.record_count();
        let src = Self::record_offset(index + 1);
        let dst = Self::record_offset(index);
        let tail_len = (count - index - 1) * RECORD_SIZE;
        self.data.copy_within(src..src + tail_len, dst);
        let last = Self::record_offset(count - 1);
        self.data[last..last + RECORD_SIZE].fill(0);
        self.set_record_count(count - 1);
        true
    }
}
