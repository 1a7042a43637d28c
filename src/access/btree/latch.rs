//! Per-page latching for tree traversals.
//!
//! Latches are acquired root-to-leaf and released leaf-to-root. The crab
//! trail ([`LatchCoupling`]) owns the guards taken during one descent: the
//! read path holds at most a parent and child at a time, the write path
//! holds the whole root-to-leaf spine until the operation finishes. Pages
//! queued for deletion during a structural change are freed when the trail
//! is released.

use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageId;
use crate::storage::ReaderWriterLatch;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Type of latch acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// Registry of page latches, created on first touch.
#[derive(Default)]
pub struct LatchTable {
    latches: DashMap<PageId, Arc<ReaderWriterLatch>>,
}

impl LatchTable {
    pub fn new() -> Self {
        Self {
            latches: DashMap::new(),
        }
    }

    fn latch_for(&self, page_id: PageId) -> Arc<ReaderWriterLatch> {
        let entry = self.latches.entry(page_id).or_default();
        Arc::clone(entry.value())
    }

    /// Blocks until the latch is held in `mode`.
    pub fn acquire(&self, page_id: PageId, mode: LatchMode) -> PageLatchGuard {
        let latch = self.latch_for(page_id);
        match mode {
            LatchMode::Shared => latch.rlock(),
            LatchMode::Exclusive => latch.wlock(),
        }
        PageLatchGuard {
            latch,
            mode,
            page_id,
        }
    }
}

/// A held page latch; released on drop.
pub struct PageLatchGuard {
    latch: Arc<ReaderWriterLatch>,
    mode: LatchMode,
    page_id: PageId,
}

impl PageLatchGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }
}

impl Drop for PageLatchGuard {
    fn drop(&mut self) {
        match self.mode {
            LatchMode::Shared => self.latch.runlock(),
            LatchMode::Exclusive => self.latch.wunlock(),
        }
    }
}

/// The latch trail of one tree operation.
pub struct LatchCoupling<'a> {
    table: &'a LatchTable,
    held: Vec<PageLatchGuard>,
    deleted: Vec<PageId>,
}

impl<'a> LatchCoupling<'a> {
    pub fn new(table: &'a LatchTable) -> Self {
        Self {
            table,
            held: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Latches `page_id` and pushes the guard onto the trail.
    pub fn acquire(&mut self, page_id: PageId, mode: LatchMode) {
        let guard = self.table.acquire(page_id, mode);
        self.held.push(guard);
    }

    /// Read-crab step: after latching a child, drop every ancestor latch.
    pub fn release_ancestors(&mut self) {
        while self.held.len() > 1 {
            let parent = self.held.len() - 2;
            self.held.remove(parent);
        }
    }

    /// Queues a page to be freed once the trail is released.
    pub fn add_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Drops every latch leaf-to-root, then frees the queued pages.
    pub fn release_all(&mut self, buffer_pool: &BufferPoolManager) -> Result<()> {
        while let Some(guard) = self.held.pop() {
            drop(guard);
        }
        for page_id in std::mem::take(&mut self.deleted) {
            buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }
}

impl Drop for LatchCoupling<'_> {
    fn drop(&mut self) {
        // Latches must never outlive the operation, even on error paths.
        // Queued deletions are only performed by an explicit release_all.
        while let Some(guard) = self.held.pop() {
            drop(guard);
        }
    }
}
