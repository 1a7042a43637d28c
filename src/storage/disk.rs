use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

pub const PAGE_SIZE: usize = 4096;

/// How long a caller of `write_log` waits for the previous flush to finish
/// before giving up.
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the database file and its append-only log file.
///
/// Page I/O is positional and synchronous. Log writes are handed to a
/// dedicated flusher thread; at most one flush may be outstanding at a time.
/// Page ids come from a monotonic counter that never reuses an id; page 0 is
/// reserved for the root directory and is never handed out.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Arc<Mutex<File>>,
    next_page_id: AtomicU32,
    num_writes: AtomicU64,
    num_flushes: Arc<AtomicU64>,
    flush_state: Arc<FlushState>,
    log_sender: Mutex<Option<SyncSender<Bytes>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct FlushState {
    pending: Mutex<bool>,
    done: Condvar,
}

impl DiskManager {
    /// Creates a fresh database file (truncating any existing one) together
    /// with its log file. The log file name is the database name with a
    /// `.log` extension.
    pub fn create(path: &Path) -> Result<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create database file: {:?}", path))?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.with_extension("log"))
            .with_context(|| format!("Failed to create log file for: {:?}", path))?;
        Self::build(db_file, log_file)
    }

    /// Opens an existing database file and its log file.
    pub fn open(path: &Path) -> Result<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open database file: {:?}", path))?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.with_extension("log"))
            .with_context(|| format!("Failed to open log file for: {:?}", path))?;
        Self::build(db_file, log_file)
    }

    fn build(db_file: File, log_file: File) -> Result<Self> {
        let existing_pages = (db_file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        let log_file = Arc::new(Mutex::new(log_file));
        let flush_state = Arc::new(FlushState {
            pending: Mutex::new(false),
            done: Condvar::new(),
        });
        let num_flushes = Arc::new(AtomicU64::new(0));

        let (sender, receiver) = sync_channel::<Bytes>(1);
        let flusher = Self::spawn_flusher(
            receiver,
            Arc::clone(&log_file),
            Arc::clone(&flush_state),
            Arc::clone(&num_flushes),
        );

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file,
            // Page 0 is the root directory, so allocation starts at 1.
            next_page_id: AtomicU32::new(existing_pages.max(1)),
            num_writes: AtomicU64::new(0),
            num_flushes,
            flush_state,
            log_sender: Mutex::new(Some(sender)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    fn spawn_flusher(
        receiver: Receiver<Bytes>,
        log_file: Arc<Mutex<File>>,
        flush_state: Arc<FlushState>,
        num_flushes: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while let Ok(buf) = receiver.recv() {
                {
                    let mut file = log_file.lock().unwrap();
                    if let Err(e) = file
                        .seek(SeekFrom::End(0))
                        .and_then(|_| file.write_all(&buf))
                        .and_then(|_| file.sync_data())
                    {
                        error!("log flush failed: {}", e);
                    }
                }
                num_flushes.fetch_add(1, Ordering::SeqCst);
                let mut pending = flush_state.pending.lock().unwrap();
                *pending = false;
                flush_state.done.notify_all();
            }
        })
    }

    /// Returns a fresh page id. The counter is monotonic; ids of deallocated
    /// pages are never reused.
    pub fn allocate_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// No-op: there is no on-disk free list. The file is not compacted.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Reads a page into `buf`. If the file ends before the page (or inside
    /// it), the missing tail is zero-filled and the page reads as fresh.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock().unwrap();
        let file_size = file.metadata()?.len();

        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset)).context("Failed to seek")?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buf[read..]).context("Failed to read page")?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < PAGE_SIZE {
            buf[read..].fill(0);
        }
        Ok(())
    }

    /// Writes a page and flushes it to stable storage. Extends the file if
    /// the page lies past the current end.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).context("Failed to seek")?;
        file.write_all(data).context("Failed to write page")?;
        file.sync_data().context("Failed to sync")?;
        self.num_writes.fetch_add(1, Ordering::SeqCst);
        debug!("wrote {}", page_id);
        Ok(())
    }

    /// Appends `data` to the log via the flusher thread.
    ///
    /// At most one flush may be outstanding. If a previous flush has not
    /// completed after a bounded wait, the write is rejected.
    pub fn write_log(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        {
            let mut pending = self.flush_state.pending.lock().unwrap();
            if *pending {
                let (guard, timeout) = self
                    .flush_state
                    .done
                    .wait_timeout_while(pending, LOG_FLUSH_TIMEOUT, |p| *p)
                    .unwrap();
                pending = guard;
                if timeout.timed_out() {
                    bail!(crate::storage::error::StorageError::LogFlushPending);
                }
            }
            *pending = true;
        }

        let sender = self.log_sender.lock().unwrap();
        sender
            .as_ref()
            .expect("log flusher already shut down")
            .send(data)
            .context("Log flusher thread is gone")?;
        Ok(())
    }

    /// Sequential log read from `offset`. Returns false once `offset` is at
    /// or past the end of the log; a short tail is zero-filled.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<bool> {
        let mut file = self.log_file.lock().unwrap();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(offset)).context("Failed to seek log")?;
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).context("Failed to read log")?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < buf.len() {
            buf[read..].fill(0);
        }
        Ok(true)
    }

    /// Number of pages the file currently holds.
    pub fn num_pages(&self) -> Result<u32> {
        let file = self.db_file.lock().unwrap();
        Ok((file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    /// Number of page writes performed so far.
    pub fn num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::SeqCst)
    }

    /// Number of completed log flushes.
    pub fn num_flushes(&self) -> u64 {
        self.num_flushes.load(Ordering::SeqCst)
    }

    /// True while a log flush is outstanding.
    pub fn is_flush_pending(&self) -> bool {
        *self.flush_state.pending.lock().unwrap()
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        // Closing the channel lets the flusher drain and exit.
        self.log_sender.lock().unwrap().take();
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }
        {
            let dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        dm.write_page(PageId(1), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId(1), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);
        Ok(())
    }

    #[test]
    fn test_read_past_eof_is_zero_filled() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;

        let mut buf = vec![7u8; PAGE_SIZE];
        dm.read_page(PageId(10), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_allocate_page_is_monotonic_and_skips_directory() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;

        assert_eq!(dm.allocate_page(), PageId(1));
        assert_eq!(dm.allocate_page(), PageId(2));
        assert_eq!(dm.allocate_page(), PageId(3));
        Ok(())
    }

    #[test]
    fn test_allocation_resumes_after_reopen() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&file_path)?;
            let pid = dm.allocate_page();
            dm.write_page(pid, &vec![9u8; PAGE_SIZE])?;
        }
        {
            let dm = DiskManager::open(&file_path)?;
            // Pages 0 and 1 exist on disk now; the next id must be past them.
            assert_eq!(dm.allocate_page(), PageId(2));
        }
        Ok(())
    }

    #[test]
    fn test_write_counter() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;

        assert_eq!(dm.num_writes(), 0);
        dm.write_page(PageId(1), &vec![0u8; PAGE_SIZE])?;
        dm.write_page(PageId(2), &vec![0u8; PAGE_SIZE])?;
        assert_eq!(dm.num_writes(), 2);
        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&file_path)?;
            dm.write_page(PageId(1), &vec![99u8; PAGE_SIZE])?;
        }
        {
            let dm = DiskManager::open(&file_path)?;
            let mut buf = vec![0u8; PAGE_SIZE];
            dm.read_page(PageId(1), &mut buf)?;
            assert_eq!(buf[0], 99);
        }
        Ok(())
    }

    #[test]
    fn test_write_log_and_read_back() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;

        dm.write_log(Bytes::from_static(b"hello "))?;
        dm.write_log(Bytes::from_static(b"world"))?;

        // Wait for the flusher to drain both records.
        while dm.num_flushes() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut buf = vec![0u8; 11];
        assert!(dm.read_log(&mut buf, 0)?);
        assert_eq!(&buf, b"hello world");

        // Reading at the end reports EOF.
        assert!(!dm.read_log(&mut buf, 11)?);
        Ok(())
    }

    #[test]
    fn test_empty_log_write_is_noop() -> Result<()> {
        let dir = tempdir()?;
        let dm = DiskManager::create(&dir.path().join("test.db"))?;
        dm.write_log(Bytes::new())?;
        assert_eq!(dm.num_flushes(), 0);
        Ok(())
    }
}
