pub mod lru;
pub mod replacer;

use crate::config::StorageConfig;
use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use crate::storage::{DiskManager, PAGE_SIZE};
use anyhow::Result;
use parking_lot::Mutex;
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, error};

/// One in-memory slot that can hold a page.
struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page_id: None,
            pin_count: 0,
            is_dirty: false,
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count = 0;
        self.is_dirty = false;
        self.data.fill(0);
    }
}

/// Frame table, free list and replacer move together under one latch, so
/// every public operation observes them in a consistent state.
struct PoolState {
    frames: Vec<Frame>,
    free_list: VecDeque<FrameId>,
    page_table: HashMap<PageId, FrameId>,
    replacer: Box<dyn Replacer>,
}

/// Mediates all access to the on-disk page file through a fixed set of
/// frames.
///
/// Fetching a page pins it; the returned guard unpins on drop, so pins are
/// balanced on every exit path. A frame is evictable exactly while its pin
/// count is zero. Dirty victims are written back before their frame is
/// reused.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    state: Mutex<PoolState>,
    disk: DiskManager,
    eager_flush: bool,
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager, replacer: Box<dyn Replacer>, config: &StorageConfig) -> Self {
        let frames = (0..config.pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..config.pool_size).collect();
        Self {
            inner: Arc::new(BufferPoolInner {
                state: Mutex::new(PoolState {
                    frames,
                    free_list,
                    page_table: HashMap::with_capacity(config.pool_size),
                    replacer,
                }),
                disk,
                eager_flush: config.eager_flush,
            }),
        }
    }

    /// Fetches a page for reading, pinning it for the guard's lifetime.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageReadGuard> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = state.page_table.get(&page_id).copied() {
            let frame = &mut state.frames[frame_id];
            frame.pin_count += 1;
            let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];
            state.replacer.pin(frame_id);
            return Ok(PageReadGuard {
                inner: Arc::clone(&self.inner),
                frame_id,
                data,
            });
        }

        let frame_id = Self::acquire_frame(&mut state, &self.inner.disk)?;
        {
            let state = &mut *state;
            let frame = &mut state.frames[frame_id];
            if let Err(e) = self.inner.disk.read_page(page_id, frame.data.as_mut()) {
                state.free_list.push_back(frame_id);
                return Err(e);
            }
            frame.page_id = Some(page_id);
            frame.pin_count = 1;
            frame.is_dirty = false;
        }
        state.page_table.insert(page_id, frame_id);

        let data = state.frames[frame_id].data.as_ref() as *const [u8; PAGE_SIZE];
        Ok(PageReadGuard {
            inner: Arc::clone(&self.inner),
            frame_id,
            data,
        })
    }

    /// Fetches a page for writing. The frame is marked dirty up front.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = state.page_table.get(&page_id).copied() {
            let frame = &mut state.frames[frame_id];
            frame.pin_count += 1;
            frame.is_dirty = true;
            let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
            state.replacer.pin(frame_id);
            return Ok(PageWriteGuard {
                inner: Arc::clone(&self.inner),
                frame_id,
                data,
            });
        }

        let frame_id = Self::acquire_frame(&mut state, &self.inner.disk)?;
        {
            let state = &mut *state;
            let frame = &mut state.frames[frame_id];
            if let Err(e) = self.inner.disk.read_page(page_id, frame.data.as_mut()) {
                state.free_list.push_back(frame_id);
                return Err(e);
            }
            frame.page_id = Some(page_id);
            frame.pin_count = 1;
            frame.is_dirty = true;
        }
        state.page_table.insert(page_id, frame_id);

        let data = state.frames[frame_id].data.as_mut() as *mut [u8; PAGE_SIZE];
        Ok(PageWriteGuard {
            inner: Arc::clone(&self.inner),
            frame_id,
            data,
        })
    }

    /// Allocates a fresh page id and installs a zeroed page for it.
    pub fn new_page(&self) -> Result<(PageId, PageWriteGuard)> {
        let mut state = self.inner.state.lock();

        let frame_id = Self::acquire_frame(&mut state, &self.inner.disk)?;
        let page_id = self.inner.disk.allocate_page();

        let frame = &mut state.frames[frame_id];
        frame.page_id = Some(page_id);
        frame.pin_count = 1;
        frame.is_dirty = true;
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        state.page_table.insert(page_id, frame_id);

        Ok((
            page_id,
            PageWriteGuard {
                inner: Arc::clone(&self.inner),
                frame_id,
                data,
            },
        ))
    }

    /// Writes a page back unconditionally and clears its dirty bit.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return Ok(false);
        };
        let data: &[u8] = state.frames[frame_id].data.as_ref();
        self.inner.disk.write_page(page_id, data)?;
        state.frames[frame_id].is_dirty = false;
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let resident: Vec<(PageId, FrameId)> =
            state.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in resident {
            let data: &[u8] = state.frames[frame_id].data.as_ref();
            self.inner.disk.write_page(page_id, data)?;
            state.frames[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Drops a page from the pool and returns its frame to the free list.
    /// Returns true if the page was absent or deleted, false if it is still
    /// pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return Ok(true);
        };
        if state.frames[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.replacer.pin(frame_id);
        state.frames[frame_id].reset();
        state.page_table.remove(&page_id);
        state.free_list.push_back(frame_id);
        self.inner.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Number of frames on the free list. Together with the page table this
    /// partitions the pool: `free_frames() + resident_pages() == pool_size`.
    pub fn free_frames(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Number of pages currently mapped to a frame.
    pub fn resident_pages(&self) -> usize {
        self.inner.state.lock().page_table.len()
    }

    /// Number of frames the replacer currently considers evictable.
    pub fn evictable_frames(&self) -> usize {
        self.inner.state.lock().replacer.size()
    }

    /// The underlying disk manager, for observability.
    pub fn disk(&self) -> &DiskManager {
        &self.inner.disk
    }

    /// Picks a frame: free list first, then a replacer victim (writing the
    /// victim back if dirty).
    fn acquire_frame(state: &mut PoolState, disk: &DiskManager) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state
            .replacer
            .evict()
            .ok_or(StorageError::BufferPoolFull)?;

        let frame = &mut state.frames[frame_id];
        assert_eq!(frame.pin_count, 0, "evicting a pinned frame");
        if let Some(old_page_id) = frame.page_id {
            if frame.is_dirty {
                debug!("writing back evicted {}", old_page_id);
                disk.write_page(old_page_id, frame.data.as_ref())?;
            }
            state.page_table.remove(&old_page_id);
        }
        state.frames[frame_id].reset();
        Ok(frame_id)
    }

    fn unpin_frame(inner: &BufferPoolInner, frame_id: FrameId) {
        let mut state = inner.state.lock();
        let (now_unpinned, flush_target) = {
            let frame = &mut state.frames[frame_id];
            assert!(frame.pin_count > 0, "pin count underflow on frame {}", frame_id);
            frame.pin_count -= 1;
            let now_unpinned = frame.pin_count == 0;
            let flush_target = if now_unpinned && inner.eager_flush && frame.is_dirty {
                frame.page_id
            } else {
                None
            };
            (now_unpinned, flush_target)
        };

        if let Some(page_id) = flush_target {
            let data: &[u8] = state.frames[frame_id].data.as_ref();
            match inner.disk.write_page(page_id, data) {
                Ok(()) => state.frames[frame_id].is_dirty = false,
                Err(e) => error!("eager flush of {} failed: {}", page_id, e),
            }
        }
        if now_unpinned {
            state.replacer.unpin(frame_id);
        }
    }
}

/// Shared, pinned view of a page's bytes. Dropping it releases the pin.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *const [u8; PAGE_SIZE],
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        BufferPoolManager::unpin_frame(&self.inner, self.frame_id);
    }
}

/// Pinned view of a page's bytes with write access. The frame is marked
/// dirty when the guard is created; dropping it releases the pin.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *mut [u8; PAGE_SIZE],
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        BufferPoolManager::unpin_frame(&self.inner, self.frame_id);
    }
}

// The raw page pointers stay valid while the guard holds its pin; access
// across threads is serialized by page latches above this layer.
unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}

#[cfg(test)]
mod tests {
    use super::lru::LruReplacer;
    use super::*;
    use tempfile::tempdir;

    fn test_pool(pool_size: usize) -> Result<(BufferPoolManager, tempfile::TempDir)> {
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let config = StorageConfig {
            pool_size,
            ..Default::default()
        };
        let replacer = Box::new(LruReplacer::new(pool_size));
        Ok((BufferPoolManager::new(disk, replacer, &config), dir))
    }

    #[test]
    fn test_new_page() -> Result<()> {
        let (pool, _dir) = test_pool(10)?;

        let (page_id, mut guard) = pool.new_page()?;
        assert_eq!(page_id, PageId(1));

        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);
        Ok(())
    }

    #[test]
    fn test_fetch_write() -> Result<()> {
        let (pool, _dir) = test_pool(10)?;

        let (page_id, mut guard) = pool.new_page()?;
        guard[0] = 10;
        drop(guard);

        let mut guard = pool.fetch_page_write(page_id)?;
        guard[0] = 20;
        drop(guard);

        let guard = pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 20);
        Ok(())
    }

    #[test]
    fn test_eviction_writes_back() -> Result<()> {
        let (pool, _dir) = test_pool(2)?;

        let (page_id1, mut guard1) = pool.new_page()?;
        guard1[0] = 1;
        drop(guard1);

        let (page_id2, mut guard2) = pool.new_page()?;
        guard2[0] = 2;
        drop(guard2);

        let (_page_id3, mut guard3) = pool.new_page()?;
        guard3[0] = 3;
        drop(guard3);

        // Page 1 was evicted and must come back from disk intact.
        let guard1 = pool.fetch_page(page_id1)?;
        assert_eq!(guard1[0], 1);
        drop(guard1);

        let guard2 = pool.fetch_page(page_id2)?;
        assert_eq!(guard2[0], 2);
        Ok(())
    }

    #[test]
    fn test_all_pinned_fails() -> Result<()> {
        let (pool, _dir) = test_pool(2)?;

        let (_p1, _g1) = pool.new_page()?;
        let (_p2, _g2) = pool.new_page()?;

        assert!(pool.new_page().is_err());
        Ok(())
    }

    #[test]
    fn test_pinned_page_survives_pressure() -> Result<()> {
        let (pool, _dir) = test_pool(2)?;

        let (page_id1, mut guard1) = pool.new_page()?;
        guard1[0] = 1;
        drop(guard1);

        // Page 2 stays pinned, so page 1 is the only possible victim.
        let (_page_id2, guard2) = pool.new_page()?;

        let (_page_id3, mut guard3) = pool.new_page()?;
        guard3[0] = 3;
        drop(guard3);
        drop(guard2);

        let g1 = pool.fetch_page(page_id1)?;
        assert_eq!(g1[0], 1);
        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let (pool, _dir) = test_pool(4)?;

        let (page_id, guard) = pool.new_page()?;
        // Pinned pages cannot be deleted.
        assert!(!pool.delete_page(page_id)?);
        drop(guard);

        assert!(pool.delete_page(page_id)?);
        // Deleting an absent page is a no-op success.
        assert!(pool.delete_page(page_id)?);
        Ok(())
    }

    #[test]
    fn test_pool_partition_invariant() -> Result<()> {
        let (pool, _dir) = test_pool(4)?;

        assert_eq!(pool.free_frames(), 4);
        assert_eq!(pool.resident_pages(), 0);

        let (p1, g1) = pool.new_page()?;
        let (_p2, g2) = pool.new_page()?;
        assert_eq!(pool.free_frames() + pool.resident_pages(), 4);
        assert_eq!(pool.evictable_frames(), 0);

        drop(g1);
        drop(g2);
        assert_eq!(pool.evictable_frames(), 2);
        assert_eq!(pool.free_frames() + pool.resident_pages(), 4);

        pool.delete_page(p1)?;
        assert_eq!(pool.free_frames() + pool.resident_pages(), 4);
        assert_eq!(pool.evictable_frames(), 1);
        Ok(())
    }

    #[test]
    fn test_flush_page_clears_dirty() -> Result<()> {
        let (pool, _dir) = test_pool(4)?;

        let (page_id, mut guard) = pool.new_page()?;
        guard[0] = 99;
        drop(guard);

        let writes_before = pool.disk().num_writes();
        assert!(pool.flush_page(page_id)?);
        assert_eq!(pool.disk().num_writes(), writes_before + 1);

        // Absent pages report false.
        assert!(!pool.flush_page(PageId(999))?);
        Ok(())
    }

    #[test]
    fn test_flush_all_persists() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let config = StorageConfig {
            pool_size: 4,
            ..Default::default()
        };

        let page_id = {
            let disk = DiskManager::create(&path)?;
            let pool =
                BufferPoolManager::new(disk, Box::new(LruReplacer::new(4)), &config);
            let (page_id, mut guard) = pool.new_page()?;
            guard[7] = 77;
            drop(guard);
            pool.flush_all()?;
            page_id
        };

        let disk = DiskManager::open(&path)?;
        let pool = BufferPoolManager::new(disk, Box::new(LruReplacer::new(4)), &config);
        let guard = pool.fetch_page(page_id)?;
        assert_eq!(guard[7], 77);
        Ok(())
    }

    #[test]
    fn test_repeated_fetch_increments_pin() -> Result<()> {
        let (pool, _dir) = test_pool(2)?;

        let (page_id, guard_a) = pool.new_page()?;
        let guard_b = pool.fetch_page(page_id)?;

        drop(guard_a);
        // Still pinned through guard_b, so not evictable.
        assert_eq!(pool.evictable_frames(), 0);
        drop(guard_b);
        assert_eq!(pool.evictable_frames(), 1);
        Ok(())
    }
}
