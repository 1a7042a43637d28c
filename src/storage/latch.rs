//! Reader/writer latch with writer preference.
//!
//! A writer that is waiting for in-flight readers to drain blocks new
//! readers from entering; without that, a steady read load starves writers
//! forever. The reader count is capped at `u32::MAX`.

use std::sync::{Condvar, Mutex};

const MAX_READERS: u32 = u32::MAX;

#[derive(Default)]
struct LatchState {
    reader_count: u32,
    writer_entered: bool,
}

/// Short-term synchronization primitive guarding one page's bytes.
///
/// Unlike `std::sync::RwLock`, acquisition and release are explicit and not
/// tied to a lifetime, which is what latch crabbing needs: a latch taken on
/// the way down a tree is released by whoever unwinds the trail.
#[derive(Default)]
pub struct ReaderWriterLatch {
    state: Mutex<LatchState>,
    reader_cv: Condvar,
    writer_cv: Condvar,
}

impl ReaderWriterLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the latch in shared mode. Blocks while a writer holds it or
    /// is waiting to enter.
    pub fn rlock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer_entered || state.reader_count == MAX_READERS {
            state = self.reader_cv.wait(state).unwrap();
        }
        state.reader_count += 1;
    }

    /// Releases a shared acquisition.
    pub fn runlock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.reader_count > 0, "runlock without matching rlock");
        state.reader_count -= 1;
        if state.writer_entered {
            if state.reader_count == 0 {
                self.writer_cv.notify_one();
            }
        } else if state.reader_count == MAX_READERS - 1 {
            self.reader_cv.notify_one();
        }
    }

    /// Acquires the latch in exclusive mode. At most one writer holds the
    /// latch; while it waits for readers to drain, no new reader may enter.
    pub fn wlock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer_entered {
            state = self.reader_cv.wait(state).unwrap();
        }
        state.writer_entered = true;
        while state.reader_count > 0 {
            state = self.writer_cv.wait(state).unwrap();
        }
    }

    /// Releases an exclusive acquisition.
    pub fn wunlock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer_entered, "wunlock without matching wlock");
        state.writer_entered = false;
        self.reader_cv.notify_all();
    }
}
