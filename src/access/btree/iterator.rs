//! Leaf-chained range iteration.
//!
//! The iterator pins the leaf it is positioned on and walks the sibling
//! chain in ascending key order; advancing off a leaf releases its pin and
//! pins the next one. It takes no latches: callers are responsible for
//! serializing scans against structural modification of the tree.

use crate::access::rid::Rid;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard};
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::PageId;
use anyhow::Result;

pub struct BTreeIterator {
    buffer_pool: BufferPoolManager,
    position: Option<Position>,
}

struct Position {
    // The pin outlives every read of the leaf it covers.
    _guard: PageReadGuard,
    leaf: BTreeLeafPage,
    slot: usize,
}

impl BTreeIterator {
    /// The past-the-end iterator.
    pub(crate) fn end(buffer_pool: BufferPoolManager) -> Self {
        Self {
            buffer_pool,
            position: None,
        }
    }

    /// An iterator standing on `slot` of the given leaf. If the slot is past
    /// the leaf's last entry, the iterator steps forward along the chain.
    pub(crate) fn positioned(
        buffer_pool: BufferPoolManager,
        leaf_id: PageId,
        slot: usize,
    ) -> Result<Self> {
        let guard = buffer_pool.fetch_page(leaf_id)?;
        let leaf = BTreeLeafPage::from_data(&guard)?;
        let mut iter = Self {
            buffer_pool,
            position: Some(Position {
                _guard: guard,
                leaf,
                slot,
            }),
        };
        iter.skip_exhausted_leaves()?;
        Ok(iter)
    }

    pub fn is_end(&self) -> bool {
        self.position.is_none()
    }

    /// The entry under the cursor, or `None` at the end.
    pub fn entry(&self) -> Option<(Vec<u8>, Rid)> {
        let position = self.position.as_ref()?;
        Some((
            position.leaf.key_at(position.slot).to_vec(),
            position.leaf.rid_at(position.slot),
        ))
    }

    /// Steps to the next entry, following the leaf chain when the current
    /// leaf is exhausted. A no-op at the end.
    pub fn advance(&mut self) -> Result<()> {
        if let Some(position) = self.position.as_mut() {
            position.slot += 1;
        }
        self.skip_exhausted_leaves()
    }

    fn skip_exhausted_leaves(&mut self) -> Result<()> {
        loop {
            let Some(position) = self.position.as_ref() else {
                return Ok(());
            };
            if position.slot < position.leaf.size() {
                return Ok(());
            }
            match position.leaf.next_page_id() {
                None => {
                    self.position = None;
                }
                Some(next_id) => {
                    let guard = self.buffer_pool.fetch_page(next_id)?;
                    let leaf = BTreeLeafPage::from_data(&guard)?;
                    self.position = Some(Position {
                        _guard: guard,
                        leaf,
                        slot: 0,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::key::MemcmpComparator;
    use crate::config::StorageConfig;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn test_pool() -> Result<(BufferPoolManager, tempfile::TempDir)> {
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let config = StorageConfig::default();
        let pool = BufferPoolManager::new(
            disk,
            Box::new(LruReplacer::new(config.pool_size)),
            &config,
        );
        Ok((pool, dir))
    }

    fn rid(n: u32) -> Rid {
        Rid::new(PageId(n), 0)
    }

    #[test]
    fn test_end_iterator() -> Result<()> {
        let (pool, _dir) = test_pool()?;
        let mut iter = BTreeIterator::end(pool);
        assert!(iter.is_end());
        assert_eq!(iter.entry(), None);
        iter.advance()?;
        assert!(iter.is_end());
        Ok(())
    }

    #[test]
    fn test_walks_leaf_chain() -> Result<()> {
        let cmp = MemcmpComparator;
        let (pool, _dir) = test_pool()?;

        // Two chained leaves built by hand.
        let (first_id, mut first_guard) = pool.new_page()?;
        let (second_id, mut second_guard) = pool.new_page()?;

        let mut first = BTreeLeafPage::new(first_id, 4);
        first.insert(b"a", rid(1), &cmp).unwrap();
        first.insert(b"b", rid(2), &cmp).unwrap();
        first.set_next_page_id(Some(second_id));
        first_guard.copy_from_slice(first.data());
        drop(first_guard);

        let mut second = BTreeLeafPage::new(second_id, 4);
        second.insert(b"c", rid(3), &cmp).unwrap();
        second_guard.copy_from_slice(second.data());
        drop(second_guard);

        let mut iter = BTreeIterator::positioned(pool, first_id, 0)?;
        let mut seen = Vec::new();
        while let Some((key, value)) = iter.entry() {
            seen.push((key, value));
            iter.advance()?;
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), rid(1)),
                (b"b".to_vec(), rid(2)),
                (b"c".to_vec(), rid(3)),
            ]
        );
        assert!(iter.is_end());
        Ok(())
    }

    #[test]
    fn test_start_past_leaf_end_steps_forward() -> Result<()> {
        let cmp = MemcmpComparator;
        let (pool, _dir) = test_pool()?;

        let (first_id, mut first_guard) = pool.new_page()?;
        let (second_id, mut second_guard) = pool.new_page()?;

        let mut first = BTreeLeafPage::new(first_id, 4);
        first.insert(b"a", rid(1), &cmp).unwrap();
        first.set_next_page_id(Some(second_id));
        first_guard.copy_from_slice(first.data());
        drop(first_guard);

        let mut second = BTreeLeafPage::new(second_id, 4);
        second.insert(b"z", rid(9), &cmp).unwrap();
        second_guard.copy_from_slice(second.data());
        drop(second_guard);

        // Slot 1 is past the first leaf's single entry.
        let iter = BTreeIterator::positioned(pool, first_id, 1)?;
        assert_eq!(iter.entry(), Some((b"z".to_vec(), rid(9))));
        Ok(())
    }

    #[test]
    fn test_iterator_pin_is_released_on_advance() -> Result<()> {
        let cmp = MemcmpComparator;
        let (pool, _dir) = test_pool()?;

        let (leaf_id, mut guard) = pool.new_page()?;
        let mut leaf = BTreeLeafPage::new(leaf_id, 4);
        leaf.insert(b"a", rid(1), &cmp).unwrap();
        guard.copy_from_slice(leaf.data());
        drop(guard);

        let evictable_before = pool.evictable_frames();
        let mut iter = BTreeIterator::positioned(pool.clone(), leaf_id, 0)?;
        assert_eq!(pool.evictable_frames(), evictable_before - 1);

        iter.advance()?;
        assert!(iter.is_end());
        // The pin on the leaf is gone once the iterator moved off it.
        assert_eq!(pool.evictable_frames(), evictable_before);
        Ok(())
    }
}
