//! Linear-probing hash index over block pages.
//!
//! A hash code picks a block and a slot within it; probing advances
//! slot-by-slot, wrapping to the next block, and terminates at the first
//! true empty (neither occupied nor readable) or after a full cycle.
//! Tombstones are probed through. The table grows by rehashing everything
//! into a fresh header and block set under the exclusive table latch.

use crate::access::key::{fnv1a, KeyComparator};
use crate::access::rid::Rid;
use crate::config::StorageConfig;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::StorageError;
use crate::storage::page::directory_page::DirectoryPage;
use crate::storage::page::hash_block_page::{HashBlockGeometry, HashBlockPage};
use crate::storage::page::hash_header_page::HashHeaderPage;
use crate::storage::page::{PageId, HEADER_PAGE_ID};
use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;

enum ProbeOutcome {
    Inserted,
    Duplicate,
    Full,
}

/// Multi-map from fixed-width keys to row ids with linear-probe collision
/// resolution. Duplicate `(key, value)` pairs are rejected; the same key may
/// map to several values.
pub struct LinearProbeHashTable {
    name: String,
    buffer_pool: BufferPoolManager,
    comparator: Arc<dyn KeyComparator>,
    geometry: HashBlockGeometry,
    header_page_id: Mutex<PageId>,
    table_latch: RwLock<()>,
    count: AtomicUsize,
}

impl LinearProbeHashTable {
    /// Opens the table named `name`, creating its header and initial blocks
    /// if this is the first time.
    pub fn open(
        name: &str,
        buffer_pool: BufferPoolManager,
        comparator: Arc<dyn KeyComparator>,
        config: &StorageConfig,
    ) -> Result<Self> {
        let geometry = HashBlockGeometry {
            block_array_size: config.block_array_size,
            key_size: config.hash_key_size,
        };
        assert!(
            geometry.fits_in_page(),
            "hash geometry does not fit in a page"
        );
        assert!(config.default_block_count > 0);

        let existing = {
            let guard = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let directory = DirectoryPage::from_data(&guard)?;
            directory.get_root_id(name)
        };

        let header_page_id = match existing {
            Some(Some(header_page_id)) => header_page_id,
            record => {
                let (header_page_id, mut header_guard) = buffer_pool.new_page()?;
                let mut header = HashHeaderPage::new();
                for _ in 0..config.default_block_count {
                    let (block_page_id, mut block_guard) = buffer_pool.new_page()?;
                    let block = HashBlockPage::new(geometry);
                    block_guard.copy_from_slice(block.data());
                    drop(block_guard);
                    header.add_block_page_id(block_page_id)?;
                }
                header.set_size(config.default_block_count * geometry.block_array_size);
                header_guard.copy_from_slice(header.data());
                drop(header_guard);

                let mut guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
                let mut directory = DirectoryPage::from_data(&guard)?;
                if record.is_some() {
                    directory.update_record(name, Some(header_page_id))?;
                } else {
                    directory.insert_record(name, Some(header_page_id))?;
                }
                guard.copy_from_slice(directory.data());
                header_page_id
            }
        };

        let table = Self {
            name: name.to_string(),
            buffer_pool,
            comparator,
            geometry,
            header_page_id: Mutex::new(header_page_id),
            table_latch: RwLock::new(()),
            count: AtomicUsize::new(0),
        };
        table.count.store(table.scan_live_count()?, AtomicOrdering::SeqCst);
        Ok(table)
    }

    /// Number of live entries.
    pub fn get_size(&self) -> usize {
        self.count.load(AtomicOrdering::SeqCst)
    }

    /// The current header page id. Changes exactly when the table resizes.
    pub fn header_page_id(&self) -> PageId {
        *self.header_page_id.lock()
    }

    /// Collects every value stored under `key`.
    pub fn get_value(&self, key: &[u8]) -> Result<Vec<Rid>> {
        let key = self.pad_key(key)?;
        let _latch = self.table_latch.read();
        let header_page_id = *self.header_page_id.lock();
        let header = self.load_header(header_page_id)?;

        let mut result = Vec::new();
        let block_array_size = self.geometry.block_array_size;
        let hash = fnv1a(&key) as usize;
        let total_slots = header.num_blocks() * block_array_size;
        let mut block_index = (hash / block_array_size) % header.num_blocks();
        let mut slot = hash % block_array_size;
        let mut scanned = 0;

        while scanned < total_slots {
            let block_page_id = header.block_page_id(block_index);
            let guard = self.buffer_pool.fetch_page(block_page_id)?;
            let block = HashBlockPage::from_data(&guard, self.geometry)?;
            for i in slot..block_array_size {
                if scanned == total_slots {
                    break;
                }
                scanned += 1;
                let occupied = block.is_occupied(i);
                let readable = block.is_readable(i);
                if readable {
                    debug_assert!(occupied, "readable slot must be occupied");
                    if self.comparator.compare(block.key_at(i), &key) == Ordering::Equal {
                        result.push(block.rid_at(i));
                    }
                } else if !occupied {
                    // True empty terminates the probe.
                    return Ok(result);
                }
                // Tombstones are skipped, never terminated on.
            }
            drop(guard);
            slot = 0;
            block_index = (block_index + 1) % header.num_blocks();
        }
        Ok(result)
    }

    /// Inserts `(key, value)`, growing the table if a full probe cycle finds
    /// no slot. Returns false if the exact pair is already present.
    pub fn insert(&self, key: &[u8], value: Rid) -> Result<bool> {
        let key = self.pad_key(key)?;
        loop {
            let observed_header = {
                let _latch = self.table_latch.read();
                let header_page_id = *self.header_page_id.lock();
                match self.probe_insert(header_page_id, &key, value, true)? {
                    ProbeOutcome::Duplicate => return Ok(false),
                    ProbeOutcome::Inserted => {
                        self.count.fetch_add(1, AtomicOrdering::SeqCst);
                        return Ok(true);
                    }
                    ProbeOutcome::Full => header_page_id,
                }
            };
            debug!("hash table {} full, resizing", self.name);
            self.resize(observed_header)?;
        }
    }

    /// Removes the exact `(key, value)` pair, leaving a tombstone. Returns
    /// false if the probe reaches a true empty without finding it.
    pub fn remove(&self, key: &[u8], value: Rid) -> Result<bool> {
        let key = self.pad_key(key)?;
        let _latch = self.table_latch.read();
        let header_page_id = *self.header_page_id.lock();
        let header = self.load_header(header_page_id)?;

        let block_array_size = self.geometry.block_array_size;
        let hash = fnv1a(&key) as usize;
        let total_slots = header.num_blocks() * block_array_size;
        let mut block_index = (hash / block_array_size) % header.num_blocks();
        let mut slot = hash % block_array_size;
        let mut scanned = 0;

        while scanned < total_slots {
            let block_page_id = header.block_page_id(block_index);
            let mut guard = self.buffer_pool.fetch_page_write(block_page_id)?;
            let mut block = HashBlockPage::from_data(&guard, self.geometry)?;
            for i in slot..block_array_size {
                if scanned == total_slots {
                    break;
                }
                scanned += 1;
                let occupied = block.is_occupied(i);
                let readable = block.is_readable(i);
                if readable {
                    if self.comparator.compare(block.key_at(i), &key) == Ordering::Equal
                        && block.rid_at(i) == value
                    {
                        block.remove(i);
                        guard.copy_from_slice(block.data());
                        self.count.fetch_sub(1, AtomicOrdering::SeqCst);
                        return Ok(true);
                    }
                } else if !occupied {
                    return Ok(false);
                }
            }
            drop(guard);
            slot = 0;
            block_index = (block_index + 1) % header.num_blocks();
        }
        Ok(false)
    }

    /// One probe pass over the table rooted at `header_page_id`. Does not
    /// touch the table latch; callers hold it in the appropriate mode.
    fn probe_insert(
        &self,
        header_page_id: PageId,
        key: &[u8],
        value: Rid,
        check_duplicate: bool,
    ) -> Result<ProbeOutcome> {
        let header = self.load_header(header_page_id)?;
        let block_array_size = self.geometry.block_array_size;
        let hash = fnv1a(key) as usize;
        let total_slots = header.num_blocks() * block_array_size;
        let mut block_index = (hash / block_array_size) % header.num_blocks();
        let mut slot = hash % block_array_size;
        let mut scanned = 0;

        while scanned < total_slots {
            let block_page_id = header.block_page_id(block_index);
            let mut guard = self.buffer_pool.fetch_page_write(block_page_id)?;
            let mut block = HashBlockPage::from_data(&guard, self.geometry)?;
            for i in slot..block_array_size {
                if scanned == total_slots {
                    break;
                }
                scanned += 1;
                let occupied = block.is_occupied(i);
                let readable = block.is_readable(i);
                if readable {
                    if check_duplicate
                        && self.comparator.compare(block.key_at(i), key) == Ordering::Equal
                        && block.rid_at(i) == value
                    {
                        return Ok(ProbeOutcome::Duplicate);
                    }
                } else {
                    // Tombstone or true empty: both take the new entry.
                    block.insert(i, key, value);
                    guard.copy_from_slice(block.data());
                    return Ok(ProbeOutcome::Inserted);
                }
            }
            drop(guard);
            slot = 0;
            block_index = (block_index + 1) % header.num_blocks();
        }
        Ok(ProbeOutcome::Full)
    }

    /// Grows the table: fresh header, twice the blocks the live entries
    /// need, rehash of every readable slot, then the old pages are freed.
    /// No-op if another thread already swapped the header out.
    fn resize(&self, observed_header: PageId) -> Result<()> {
        let _latch = self.table_latch.write();
        if *self.header_page_id.lock() != observed_header {
            return Ok(());
        }

        let block_array_size = self.geometry.block_array_size;
        let old_header = self.load_header(observed_header)?;
        let old_blocks = old_header.block_page_ids();
        let live = self.count.load(AtomicOrdering::SeqCst);
        let new_num_blocks = (live.div_ceil(block_array_size) * 2).max(old_blocks.len() + 1);

        let (new_header_id, mut header_guard) = self.buffer_pool.new_page()?;
        let mut new_header = HashHeaderPage::new();
        for _ in 0..new_num_blocks {
            let (block_page_id, mut block_guard) = self.buffer_pool.new_page()?;
            let block = HashBlockPage::new(self.geometry);
            block_guard.copy_from_slice(block.data());
            drop(block_guard);
            new_header.add_block_page_id(block_page_id)?;
        }
        new_header.set_size(new_num_blocks * block_array_size);
        header_guard.copy_from_slice(new_header.data());
        drop(header_guard);

        {
            let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
            let mut directory = DirectoryPage::from_data(&guard)?;
            directory.update_record(&self.name, Some(new_header_id))?;
            guard.copy_from_slice(directory.data());
        }
        *self.header_page_id.lock() = new_header_id;

        for &block_page_id in &old_blocks {
            let entries: Vec<(Vec<u8>, Rid)> = {
                let guard = self.buffer_pool.fetch_page(block_page_id)?;
                let block = HashBlockPage::from_data(&guard, self.geometry)?;
                (0..block_array_size)
                    .filter(|&i| block.is_readable(i))
                    .map(|i| (block.key_at(i).to_vec(), block.rid_at(i)))
                    .collect()
            };
            for (key, value) in entries {
                match self.probe_insert(new_header_id, &key, value, false)? {
                    ProbeOutcome::Inserted => {}
                    _ => bail!("rehash found no slot in the grown table"),
                }
            }
        }

        for block_page_id in old_blocks {
            self.buffer_pool.delete_page(block_page_id)?;
        }
        self.buffer_pool.delete_page(observed_header)?;
        debug!(
            "hash table {} resized to {} blocks, header now {}",
            self.name, new_num_blocks, new_header_id
        );
        Ok(())
    }

    fn load_header(&self, header_page_id: PageId) -> Result<HashHeaderPage> {
        let guard = self.buffer_pool.fetch_page(header_page_id)?;
        Ok(HashHeaderPage::from_data(&guard)?)
    }

    fn pad_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.len() > self.geometry.key_size {
            bail!(StorageError::KeyTooLarge {
                size: key.len(),
                max: self.geometry.key_size,
            });
        }
        let mut padded = vec![0u8; self.geometry.key_size];
        padded[..key.len()].copy_from_slice(key);
        Ok(padded)
    }

    /// Counts readable slots across all blocks; used to restore `count`
    /// when reopening a persisted table.
    fn scan_live_count(&self) -> Result<usize> {
        let header = self.load_header(*self.header_page_id.lock())?;
        let mut live = 0;
        for block_page_id in header.block_page_ids() {
            let guard = self.buffer_pool.fetch_page(block_page_id)?;
            let block = HashBlockPage::from_data(&guard, self.geometry)?;
            live += block.readable_count();
        }
        Ok(live)
    }
}
