/// Index of a frame in the buffer pool's frame array.
pub type FrameId = usize;

/// Chooses which unpinned frame to evict when the pool is out of space.
///
/// A frame is tracked by the replacer exactly while its pin count is zero
/// and it still maps a page; the buffer pool calls `pin` when a frame gains
/// a pin (or leaves the table) and `unpin` when its last pin drops.
pub trait Replacer: Send {
    /// Removes and returns the victim frame, or `None` if every frame is
    /// pinned.
    fn evict(&mut self) -> Option<FrameId>;

    /// Removes a frame from the eviction candidates. No-op if absent.
    fn pin(&mut self, frame_id: FrameId);

    /// Adds a frame to the eviction candidates. No-op if already present.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of frames currently evictable.
    fn size(&self) -> usize;
}
