use super::replacer::{FrameId, Replacer};
use std::collections::{HashSet, VecDeque};

/// Strict least-recently-used replacement, ordered by last-`unpin` time.
#[derive(Debug)]
pub struct LruReplacer {
    /// Evictable frames; the victim end is the front.
    lru_list: VecDeque<FrameId>,
    /// Presence set for O(1) duplicate checks.
    present: HashSet<FrameId>,
    /// Maximum number of frames the replacer may track.
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(max_size),
            present: HashSet::with_capacity(max_size),
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let frame_id = self.lru_list.pop_front()?;
        self.present.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if self.present.remove(&frame_id) {
            self.lru_list.retain(|&f| f != frame_id);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if !self.present.contains(&frame_id) && self.lru_list.len() < self.max_size {
            self.lru_list.push_back(frame_id);
            self.present.insert(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}
