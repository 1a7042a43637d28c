pub mod iterator;
pub mod latch;

use self::iterator::BTreeIterator;
use self::latch::{LatchCoupling, LatchMode, LatchTable};
use crate::access::key::KeyComparator;
use crate::access::rid::Rid;
use crate::config::StorageConfig;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::btree_internal_page::BTreeInternalPage;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::directory_page::DirectoryPage;
use crate::storage::page::{PageId, PageType, HEADER_PAGE_ID};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Concurrent B+tree mapping unique keys to row ids.
///
/// All page access goes through the buffer pool. Traversals latch-crab:
/// point operations take read latches down the internals and a write latch
/// on the leaf; an operation that would split or merge releases everything
/// and retries with write latches held root-to-leaf, re-checking the
/// structural condition once the stricter latches are in hand (a concurrent
/// writer may have fixed it already).
///
/// The root page id is registered in the root directory under the index
/// name, so the tree survives restarts.
pub struct BTreeIndex {
    name: String,
    buffer_pool: BufferPoolManager,
    comparator: Arc<dyn KeyComparator>,
    leaf_max_size: u16,
    internal_max_size: u16,
    root: Mutex<Option<PageId>>,
    latches: LatchTable,
}

impl BTreeIndex {
    /// Opens the index named `name`, registering it in the root directory if
    /// it is new.
    pub fn open(
        name: &str,
        buffer_pool: BufferPoolManager,
        comparator: Arc<dyn KeyComparator>,
        config: &StorageConfig,
    ) -> Result<Self> {
        assert!(config.leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(
            config.internal_max_size >= 3,
            "internal_max_size must be at least 3"
        );

        let root = {
            let guard = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let directory = DirectoryPage::from_data(&guard)?;
            directory.get_root_id(name)
        };
        let root = match root {
            Some(root) => root,
            None => {
                let mut guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
                let mut directory = DirectoryPage::from_data(&guard)?;
                directory.insert_record(name, None)?;
                guard.copy_from_slice(directory.data());
                None
            }
        };

        Ok(Self {
            name: name.to_string(),
            buffer_pool,
            comparator,
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            root: Mutex::new(root),
            latches: LatchTable::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.lock().is_none()
    }

    pub fn root_page_id(&self) -> Option<PageId> {
        *self.root.lock()
    }

    /// Number of levels from root to leaf; 0 for an empty tree.
    pub fn height(&self) -> Result<u32> {
        let Some(mut page_id) = *self.root.lock() else {
            return Ok(0);
        };
        let mut height = 1;
        loop {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match PageType::of_page(&*guard) {
                Some(PageType::Leaf) => return Ok(height),
                Some(PageType::Internal) => {
                    let inner = BTreeInternalPage::from_data(&guard)?;
                    page_id = inner.child_at(0);
                    height += 1;
                }
                other => bail!("unexpected page type {:?} at {}", other, page_id),
            }
        }
    }

    /// Point lookup. Returns the payload stored under `key`.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Rid>> {
        let Some(root) = *self.root.lock() else {
            return Ok(None);
        };

        let mut coupling = LatchCoupling::new(&self.latches);
        let leaf_id = self.descend_read(root, key, &mut coupling)?;
        let result = {
            let guard = self.buffer_pool.fetch_page(leaf_id)?;
            let leaf = BTreeLeafPage::from_data(&guard)?;
            leaf.lookup(key, self.comparator.as_ref())
        };
        coupling.release_all(&self.buffer_pool)?;
        Ok(result)
    }

    /// Inserts a unique key. Returns false if the key already exists.
    pub fn insert(&self, key: &[u8], rid: Rid) -> Result<bool> {
        loop {
            if self.root.lock().is_none() {
                if self.start_new_tree(key, rid)? {
                    return Ok(true);
                }
                // Another thread published a root first; insert normally.
            }
            match self.insert_into_leaf(key, rid)? {
                Some(inserted) => return Ok(inserted),
                None => continue,
            }
        }
    }

    /// Removes `key` if present.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let Some(root) = *self.root.lock() else {
            return Ok(());
        };

        // Optimistic pass: read-crab, write latch only on the leaf.
        let mut coupling = LatchCoupling::new(&self.latches);
        let leaf_id = self.descend_read(root, key, &mut coupling)?;

        let (exists, leaf_is_root, would_underflow) = {
            let guard = self.buffer_pool.fetch_page(leaf_id)?;
            let leaf = BTreeLeafPage::from_data(&guard)?;
            (
                leaf.lookup(key, self.comparator.as_ref()).is_some(),
                leaf.is_root(),
                leaf.size() <= leaf.min_size(),
            )
        };

        if !exists {
            coupling.release_all(&self.buffer_pool)?;
            return Ok(());
        }

        if leaf_is_root || !would_underflow {
            let mut guard = self.buffer_pool.fetch_page_write(leaf_id)?;
            let mut leaf = BTreeLeafPage::from_data(&guard)?;
            leaf.remove(key, self.comparator.as_ref());
            let now_empty = leaf.is_root() && leaf.size() == 0;
            guard.copy_from_slice(leaf.data());
            drop(guard);

            if now_empty {
                debug!("tree {} became empty", self.name);
                coupling.add_deleted(leaf_id);
                self.update_root_record(None)?;
                *self.root.lock() = None;
            }
            coupling.release_all(&self.buffer_pool)?;
            return Ok(());
        }

        // Would underflow: retry with write latches held root-to-leaf.
        coupling.release_all(&self.buffer_pool)?;
        self.remove_pessimistic(key)
    }

    /// Ascending iterator from the smallest key.
    pub fn begin(&self) -> Result<BTreeIterator> {
        let Some(root) = *self.root.lock() else {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        };
        let mut page_id = root;
        loop {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match PageType::of_page(&*guard) {
                Some(PageType::Leaf) => {
                    return BTreeIterator::positioned(self.buffer_pool.clone(), page_id, 0);
                }
                Some(PageType::Internal) => {
                    let inner = BTreeInternalPage::from_data(&guard)?;
                    page_id = inner.child_at(0);
                }
                other => bail!("unexpected page type {:?} at {}", other, page_id),
            }
        }
    }

    /// Ascending iterator from the first key `>= key`.
    pub fn begin_at(&self, key: &[u8]) -> Result<BTreeIterator> {
        let Some(root) = *self.root.lock() else {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        };
        let mut page_id = root;
        loop {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match PageType::of_page(&*guard) {
                Some(PageType::Leaf) => {
                    let leaf = BTreeLeafPage::from_data(&guard)?;
                    let pos = leaf.lower_bound(key, self.comparator.as_ref());
                    return BTreeIterator::positioned(self.buffer_pool.clone(), page_id, pos);
                }
                Some(PageType::Internal) => {
                    let inner = BTreeInternalPage::from_data(&guard)?;
                    page_id = inner.lookup(key, self.comparator.as_ref());
                }
                other => bail!("unexpected page type {:?} at {}", other, page_id),
            }
        }
    }

    /// Descends with read latches, releasing each parent once the child is
    /// latched; the leaf itself is write-latched. Returns the leaf page id.
    fn descend_read(
        &self,
        root: PageId,
        key: &[u8],
        coupling: &mut LatchCoupling,
    ) -> Result<PageId> {
        let mut page_id = root;
        loop {
            let is_leaf = {
                let guard = self.buffer_pool.fetch_page(page_id)?;
                match PageType::of_page(&*guard) {
                    Some(PageType::Leaf) => true,
                    Some(PageType::Internal) => false,
                    other => bail!("unexpected page type {:?} at {}", other, page_id),
                }
            };
            let mode = if is_leaf {
                LatchMode::Exclusive
            } else {
                LatchMode::Shared
            };
            coupling.acquire(page_id, mode);
            coupling.release_ancestors();
            if is_leaf {
                return Ok(page_id);
            }

            let guard = self.buffer_pool.fetch_page(page_id)?;
            let inner = BTreeInternalPage::from_data(&guard)?;
            page_id = inner.lookup(key, self.comparator.as_ref());
        }
    }

    /// Descends holding write latches on the whole root-to-leaf spine.
    fn descend_write(
        &self,
        root: PageId,
        key: &[u8],
        coupling: &mut LatchCoupling,
    ) -> Result<PageId> {
        let mut page_id = root;
        loop {
            coupling.acquire(page_id, LatchMode::Exclusive);
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match PageType::of_page(&*guard) {
                Some(PageType::Leaf) => return Ok(page_id),
                Some(PageType::Internal) => {
                    let inner = BTreeInternalPage::from_data(&guard)?;
                    page_id = inner.lookup(key, self.comparator.as_ref());
                }
                other => bail!("unexpected page type {:?} at {}", other, page_id),
            }
        }
    }

    /// Publishes a single-leaf tree holding `(key, rid)`. Returns false if
    /// another thread created the root first.
    fn start_new_tree(&self, key: &[u8], rid: Rid) -> Result<bool> {
        let mut root = self.root.lock();
        if root.is_some() {
            return Ok(false);
        }

        let (page_id, mut guard) = self.buffer_pool.new_page()?;
        let mut leaf = BTreeLeafPage::new(page_id, self.leaf_max_size);
        leaf.insert(key, rid, self.comparator.as_ref())?;
        guard.copy_from_slice(leaf.data());
        drop(guard);

        self.update_root_record(Some(page_id))?;
        *root = Some(page_id);
        debug!("started new tree {} at {}", self.name, page_id);
        Ok(true)
    }

    /// One insert attempt. `Ok(None)` means the tree vanished underneath us
    /// and the caller should retry from the top.
    fn insert_into_leaf(&self, key: &[u8], rid: Rid) -> Result<Option<bool>> {
        let Some(root) = *self.root.lock() else {
            return Ok(None);
        };

        // Optimistic pass.
        let mut coupling = LatchCoupling::new(&self.latches);
        let leaf_id = self.descend_read(root, key, &mut coupling)?;
        let (exists, would_overflow) = {
            let guard = self.buffer_pool.fetch_page(leaf_id)?;
            let leaf = BTreeLeafPage::from_data(&guard)?;
            (
                leaf.lookup(key, self.comparator.as_ref()).is_some(),
                leaf.size() + 1 > leaf.max_size(),
            )
        };

        if exists {
            coupling.release_all(&self.buffer_pool)?;
            return Ok(Some(false));
        }
        if !would_overflow {
            let mut guard = self.buffer_pool.fetch_page_write(leaf_id)?;
            let mut leaf = BTreeLeafPage::from_data(&guard)?;
            leaf.insert(key, rid, self.comparator.as_ref())?;
            guard.copy_from_slice(leaf.data());
            drop(guard);
            coupling.release_all(&self.buffer_pool)?;
            return Ok(Some(true));
        }

        // Overflow: release the read latches and go pessimistic.
        coupling.release_all(&self.buffer_pool)?;

        let Some(root) = *self.root.lock() else {
            return Ok(None);
        };
        let mut coupling = LatchCoupling::new(&self.latches);
        let leaf_id = self.descend_write(root, key, &mut coupling)?;

        let mut guard = self.buffer_pool.fetch_page_write(leaf_id)?;
        let mut leaf = BTreeLeafPage::from_data(&guard)?;

        if leaf.lookup(key, self.comparator.as_ref()).is_some() {
            drop(guard);
            coupling.release_all(&self.buffer_pool)?;
            return Ok(Some(false));
        }

        if leaf.size() + 1 <= leaf.max_size() {
            // A concurrent delete made room while we re-latched.
            leaf.insert(key, rid, self.comparator.as_ref())?;
            guard.copy_from_slice(leaf.data());
            drop(guard);
            coupling.release_all(&self.buffer_pool)?;
            return Ok(Some(true));
        }

        // Insert, then split off the upper half into a new right sibling.
        leaf.insert(key, rid, self.comparator.as_ref())?;

        let (new_leaf_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut new_leaf = BTreeLeafPage::new(new_leaf_id, self.leaf_max_size);
        new_leaf.set_parent_page_id(leaf.parent_page_id());
        leaf.move_half_to(&mut new_leaf)?;
        let separator = new_leaf.key_at(0).to_vec();
        debug!(
            "split leaf {} into {} at separator len {}",
            leaf_id,
            new_leaf_id,
            separator.len()
        );

        let old_parent = leaf.parent_page_id();
        guard.copy_from_slice(leaf.data());
        new_guard.copy_from_slice(new_leaf.data());
        drop(guard);
        drop(new_guard);

        self.insert_into_parent(leaf_id, old_parent, &separator, new_leaf_id)?;
        coupling.release_all(&self.buffer_pool)?;
        Ok(Some(true))
    }

    /// Promotes `separator` between `old_id` and `new_id` into the parent,
    /// splitting upward as needed. A root split creates a fresh root.
    fn insert_into_parent(
        &self,
        old_id: PageId,
        old_parent: Option<PageId>,
        separator: &[u8],
        new_id: PageId,
    ) -> Result<()> {
        let Some(parent_id) = old_parent else {
            // The old node was the root.
            let (root_id, mut guard) = self.buffer_pool.new_page()?;
            let mut root = BTreeInternalPage::new(root_id, self.internal_max_size);
            root.populate_new_root(old_id, separator, new_id)?;
            guard.copy_from_slice(root.data());
            drop(guard);

            self.set_parent(old_id, Some(root_id))?;
            self.set_parent(new_id, Some(root_id))?;
            self.update_root_record(Some(root_id))?;
            *self.root.lock() = Some(root_id);
            debug!("new root {} for {}", root_id, self.name);
            return Ok(());
        };

        let mut guard = self.buffer_pool.fetch_page_write(parent_id)?;
        let mut parent = BTreeInternalPage::from_data(&guard)?;
        parent.insert(separator, new_id, self.comparator.as_ref())?;

        if parent.size() <= parent.max_size() {
            guard.copy_from_slice(parent.data());
            return Ok(());
        }

        // The parent overflowed too; split it and keep promoting.
        let (new_parent_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut new_parent = BTreeInternalPage::new(new_parent_id, self.internal_max_size);
        new_parent.set_parent_page_id(parent.parent_page_id());
        parent.move_half_to(&mut new_parent)?;
        let promoted = new_parent.key_at(0).to_vec();
        let grandparent = parent.parent_page_id();
        let moved_children: Vec<PageId> = (0..new_parent.size())
            .map(|i| new_parent.child_at(i))
            .collect();

        guard.copy_from_slice(parent.data());
        new_guard.copy_from_slice(new_parent.data());
        drop(guard);
        drop(new_guard);

        // The moved children now live under the new parent.
        for child in moved_children {
            self.set_parent(child, Some(new_parent_id))?;
        }

        self.insert_into_parent(parent_id, grandparent, &promoted, new_parent_id)
    }

    /// Pessimistic delete: write latches root-to-leaf, re-check, then fix
    /// any underflow by redistribution or merge.
    fn remove_pessimistic(&self, key: &[u8]) -> Result<()> {
        let Some(root) = *self.root.lock() else {
            return Ok(());
        };
        let mut coupling = LatchCoupling::new(&self.latches);
        let leaf_id = self.descend_write(root, key, &mut coupling)?;

        let mut guard = self.buffer_pool.fetch_page_write(leaf_id)?;
        let mut leaf = BTreeLeafPage::from_data(&guard)?;

        if leaf.lookup(key, self.comparator.as_ref()).is_none() {
            drop(guard);
            coupling.release_all(&self.buffer_pool)?;
            return Ok(());
        }

        leaf.remove(key, self.comparator.as_ref());
        let leaf_is_root = leaf.is_root();
        let now_empty = leaf.size() == 0;
        let underflow = !leaf_is_root && leaf.size() < leaf.min_size();
        guard.copy_from_slice(leaf.data());
        drop(guard);

        if leaf_is_root {
            if now_empty {
                coupling.add_deleted(leaf_id);
                self.update_root_record(None)?;
                *self.root.lock() = None;
            }
        } else if underflow {
            self.coalesce_or_redistribute(leaf_id, &mut coupling)?;
        }

        coupling.release_all(&self.buffer_pool)?;
        Ok(())
    }

    /// Restores the minimum-occupancy invariant for an underflowing node:
    /// borrow one entry from a sibling if it can spare one, otherwise merge
    /// and recurse on the parent.
    fn coalesce_or_redistribute(
        &self,
        node_id: PageId,
        coupling: &mut LatchCoupling,
    ) -> Result<()> {
        let (node_is_leaf, parent_id) = {
            let guard = self.buffer_pool.fetch_page(node_id)?;
            match PageType::of_page(&*guard) {
                Some(PageType::Leaf) => {
                    (true, BTreeLeafPage::from_data(&guard)?.parent_page_id())
                }
                Some(PageType::Internal) => {
                    (false, BTreeInternalPage::from_data(&guard)?.parent_page_id())
                }
                other => bail!("unexpected page type {:?} at {}", other, node_id),
            }
        };
        let parent_id = parent_id.expect("underflow fix reached the root");

        let mut parent_guard = self.buffer_pool.fetch_page_write(parent_id)?;
        let mut parent = BTreeInternalPage::from_data(&parent_guard)?;
        let node_index = parent
            .child_index(node_id)
            .expect("node missing from its parent's child list");
        let left_id = (node_index > 0).then(|| parent.child_at(node_index - 1));
        let right_id = (node_index + 1 < parent.size()).then(|| parent.child_at(node_index + 1));

        if node_is_leaf {
            self.fix_leaf(node_id, &mut parent, node_index, left_id, right_id, coupling)?;
        } else {
            self.fix_internal(node_id, &mut parent, node_index, left_id, right_id, coupling)?;
        }

        let parent_is_root = parent.is_root();
        let parent_size = parent.size();
        let parent_underflow = parent_size < parent.min_size();
        let only_child = (parent_is_root && parent_size == 1).then(|| parent.child_at(0));
        parent_guard.copy_from_slice(parent.data());
        drop(parent_guard);

        if !parent_is_root {
            if parent_underflow {
                self.coalesce_or_redistribute(parent_id, coupling)?;
            }
        } else if let Some(new_root) = only_child {
            // The root is down to a single child; the tree loses a level.
            debug!("collapsing root {} into {}", parent_id, new_root);
            self.set_parent(new_root, None)?;
            coupling.add_deleted(parent_id);
            self.update_root_record(Some(new_root))?;
            *self.root.lock() = Some(new_root);
        }
        Ok(())
    }

    fn fix_leaf(
        &self,
        node_id: PageId,
        parent: &mut BTreeInternalPage,
        node_index: usize,
        left_id: Option<PageId>,
        right_id: Option<PageId>,
        coupling: &mut LatchCoupling,
    ) -> Result<()> {
        let mut node_guard = self.buffer_pool.fetch_page_write(node_id)?;
        let mut node = BTreeLeafPage::from_data(&node_guard)?;

        // A sibling above its minimum can spare one entry; otherwise the
        // pair is merged.
        if let Some(left_id) = left_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut left = BTreeLeafPage::from_data(&left_guard)?;
            if left.size() > left.min_size() {
                left.move_last_to_front_of(&mut node)?;
                parent.set_key_at(node_index, node.key_at(0))?;
                left_guard.copy_from_slice(left.data());
                node_guard.copy_from_slice(node.data());
                return Ok(());
            }
        }

        if let Some(right_id) = right_id {
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let mut right = BTreeLeafPage::from_data(&right_guard)?;
            if right.size() > right.min_size() {
                right.move_first_to_end_of(&mut node)?;
                parent.set_key_at(node_index + 1, right.key_at(0))?;
                right_guard.copy_from_slice(right.data());
                node_guard.copy_from_slice(node.data());
                return Ok(());
            }
        }

        if let Some(left_id) = left_id {
            // Merge into the left sibling; the chain skips this page.
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut left = BTreeLeafPage::from_data(&left_guard)?;
            node.move_all_to(&mut left)?;
            left_guard.copy_from_slice(left.data());
            node_guard.copy_from_slice(node.data());
            parent.remove(node_index);
            coupling.add_deleted(node_id);
            debug!("merged leaf {} into {}", node_id, left_id);
            return Ok(());
        }

        if let Some(right_id) = right_id {
            // Merge the right sibling into this node to preserve the chain.
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let mut right = BTreeLeafPage::from_data(&right_guard)?;
            right.move_all_to(&mut node)?;
            right_guard.copy_from_slice(right.data());
            node_guard.copy_from_slice(node.data());
            parent.remove(node_index + 1);
            coupling.add_deleted(right_id);
            debug!("merged leaf {} into {}", right_id, node_id);
            return Ok(());
        }

        unreachable!("non-root leaf with no siblings");
    }

    fn fix_internal(
        &self,
        node_id: PageId,
        parent: &mut BTreeInternalPage,
        node_index: usize,
        left_id: Option<PageId>,
        right_id: Option<PageId>,
        coupling: &mut LatchCoupling,
    ) -> Result<()> {
        let mut node_guard = self.buffer_pool.fetch_page_write(node_id)?;
        let mut node = BTreeInternalPage::from_data(&node_guard)?;

        if let Some(left_id) = left_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut left = BTreeInternalPage::from_data(&left_guard)?;
            if left.size() > left.min_size() {
                let middle = parent.key_at(node_index).to_vec();
                left.move_last_to_front_of(&mut node, &middle)?;
                let adopted = node.child_at(0);
                parent.set_key_at(node_index, node.key_at(0))?;
                left_guard.copy_from_slice(left.data());
                node_guard.copy_from_slice(node.data());
                drop(left_guard);
                drop(node_guard);
                return self.set_parent(adopted, Some(node_id));
            }
        }

        if let Some(right_id) = right_id {
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let mut right = BTreeInternalPage::from_data(&right_guard)?;
            if right.size() > right.min_size() {
                let middle = parent.key_at(node_index + 1).to_vec();
                right.move_first_to_end_of(&mut node, &middle)?;
                let adopted = node.child_at(node.size() - 1);
                parent.set_key_at(node_index + 1, right.key_at(0))?;
                right_guard.copy_from_slice(right.data());
                node_guard.copy_from_slice(node.data());
                drop(right_guard);
                drop(node_guard);
                return self.set_parent(adopted, Some(node_id));
            }
        }

        if let Some(left_id) = left_id {
            let middle = parent.key_at(node_index).to_vec();
            let moved: Vec<PageId> = (0..node.size()).map(|i| node.child_at(i)).collect();
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut left = BTreeInternalPage::from_data(&left_guard)?;
            node.move_all_to(&mut left, &middle)?;
            left_guard.copy_from_slice(left.data());
            node_guard.copy_from_slice(node.data());
            parent.remove(node_index);
            coupling.add_deleted(node_id);
            drop(left_guard);
            drop(node_guard);
            for child in moved {
                self.set_parent(child, Some(left_id))?;
            }
            debug!("merged internal {} into {}", node_id, left_id);
            return Ok(());
        }

        if let Some(right_id) = right_id {
            let middle = parent.key_at(node_index + 1).to_vec();
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let mut right = BTreeInternalPage::from_data(&right_guard)?;
            let moved: Vec<PageId> = (0..right.size()).map(|i| right.child_at(i)).collect();
            right.move_all_to(&mut node, &middle)?;
            right_guard.copy_from_slice(right.data());
            node_guard.copy_from_slice(node.data());
            parent.remove(node_index + 1);
            coupling.add_deleted(right_id);
            drop(right_guard);
            drop(node_guard);
            for child in moved {
                self.set_parent(child, Some(node_id))?;
            }
            debug!("merged internal {} into {}", right_id, node_id);
            return Ok(());
        }

        unreachable!("non-root internal node with no siblings");
    }

    /// Rewrites a node's parent link through the buffer pool.
    fn set_parent(&self, page_id: PageId, parent: Option<PageId>) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        match PageType::of_page(&*guard) {
            Some(PageType::Leaf) => {
                let mut leaf = BTreeLeafPage::from_data(&guard)?;
                leaf.set_parent_page_id(parent);
                guard.copy_from_slice(leaf.data());
            }
            Some(PageType::Internal) => {
                let mut inner = BTreeInternalPage::from_data(&guard)?;
                inner.set_parent_page_id(parent);
                guard.copy_from_slice(inner.data());
            }
            other => bail!("unexpected page type {:?} at {}", other, page_id),
        }
        Ok(())
    }

    /// Records the current root id under this index's name in the root
    /// directory page.
    fn update_root_record(&self, root: Option<PageId>) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut directory = DirectoryPage::from_data(&guard)?;
        directory.update_record(&self.name, root)?;
        guard.copy_from_slice(directory.data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::key::{encode_i64, MemcmpComparator};
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::DiskManager;
    use rand::seq::SliceRandom;
    use tempfile::tempdir;

    fn small_config() -> StorageConfig {
        StorageConfig {
            pool_size: 32,
            leaf_max_size: 2,
            internal_max_size: 3,
            ..Default::default()
        }
    }

    fn test_tree(config: &StorageConfig) -> Result<(BTreeIndex, tempfile::TempDir)> {
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool = BufferPoolManager::new(disk, Box::new(LruReplacer::new(config.pool_size)), config);
        let tree = BTreeIndex::open("test_index", pool, Arc::new(MemcmpComparator), config)?;
        Ok((tree, dir))
    }

    fn rid(n: i64) -> Rid {
        Rid::new(PageId(n as u32), 0)
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;
        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), None);
        assert_eq!(tree.get_value(&encode_i64(1))?, None);
        assert_eq!(tree.height()?, 0);
        tree.remove(&encode_i64(1))?;
        Ok(())
    }

    #[test]
    fn test_insert_and_lookup() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;

        for k in [5i64, 4, 3, 2, 1] {
            assert!(tree.insert(&encode_i64(k), rid(k))?);
        }
        for k in 1..=5i64 {
            assert_eq!(tree.get_value(&encode_i64(k))?, Some(rid(k)));
        }
        assert_eq!(tree.get_value(&encode_i64(6))?, None);
        Ok(())
    }

    #[test]
    fn test_duplicate_insert_rejected() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;
        assert!(tree.insert(&encode_i64(1), rid(1))?);
        assert!(!tree.insert(&encode_i64(1), rid(2))?);
        assert_eq!(tree.get_value(&encode_i64(1))?, Some(rid(1)));
        Ok(())
    }

    #[test]
    fn test_split_cascades_to_new_root() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;

        // leaf_max 2: the third insert must split, and further inserts must
        // grow the tree beyond two levels.
        for k in 1..=16i64 {
            assert!(tree.insert(&encode_i64(k), rid(k))?);
        }
        assert!(tree.height()? >= 3);
        for k in 1..=16i64 {
            assert_eq!(tree.get_value(&encode_i64(k))?, Some(rid(k)));
        }
        Ok(())
    }

    #[test]
    fn test_iterator_ascending() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;

        for k in [5i64, 4, 3, 2, 1] {
            tree.insert(&encode_i64(k), rid(k))?;
        }

        let mut iter = tree.begin()?;
        let mut seen = Vec::new();
        while let Some((key, value)) = iter.entry() {
            seen.push((key.to_vec(), value));
            iter.advance()?;
        }
        let keys: Vec<i64> = seen
            .iter()
            .map(|(k, _)| crate::access::key::decode_i64(k))
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        for (k, v) in &seen {
            assert_eq!(*v, rid(crate::access::key::decode_i64(k)));
        }
        Ok(())
    }

    #[test]
    fn test_iterator_from_key() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;
        for k in 1..=9i64 {
            tree.insert(&encode_i64(k), rid(k))?;
        }

        let mut iter = tree.begin_at(&encode_i64(6))?;
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.entry() {
            keys.push(crate::access::key::decode_i64(&key));
            iter.advance()?;
        }
        assert_eq!(keys, vec![6, 7, 8, 9]);
        Ok(())
    }

    #[test]
    fn test_delete_to_empty() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;

        tree.insert(&encode_i64(1), rid(1))?;
        tree.remove(&encode_i64(1))?;

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), None);
        assert_eq!(tree.get_value(&encode_i64(1))?, None);

        // The tree is usable again after emptying.
        tree.insert(&encode_i64(2), rid(2))?;
        assert_eq!(tree.get_value(&encode_i64(2))?, Some(rid(2)));
        Ok(())
    }

    #[test]
    fn test_delete_with_merges() -> Result<()> {
        let (tree, _dir) = test_tree(&small_config())?;

        for k in 1..=5i64 {
            tree.insert(&encode_i64(k), rid(k))?;
        }
        let height_before = tree.height()?;

        for k in [1i64, 2, 3] {
            tree.remove(&encode_i64(k))?;
        }

        assert!(tree.height()? < height_before);
        assert_eq!(tree.get_value(&encode_i64(3))?, None);
        assert_eq!(tree.get_value(&encode_i64(4))?, Some(rid(4)));
        assert_eq!(tree.get_value(&encode_i64(5))?, Some(rid(5)));
        Ok(())
    }

    #[test]
    fn test_random_insert_delete_mix() -> Result<()> {
        let config = StorageConfig {
            pool_size: 64,
            leaf_max_size: 4,
            internal_max_size: 4,
            ..Default::default()
        };
        let (tree, _dir) = test_tree(&config)?;
        let mut rng = rand::thread_rng();

        let mut keys: Vec<i64> = (0..200).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            assert!(tree.insert(&encode_i64(k), rid(k))?);
        }

        let mut to_delete: Vec<i64> = (0..200).filter(|k| k % 3 == 0).collect();
        to_delete.shuffle(&mut rng);
        for &k in &to_delete {
            tree.remove(&encode_i64(k))?;
        }

        for k in 0..200i64 {
            let expected = if k % 3 == 0 { None } else { Some(rid(k)) };
            assert_eq!(tree.get_value(&encode_i64(k))?, expected, "key {}", k);
        }

        // Iteration agrees with point lookups.
        let mut iter = tree.begin()?;
        let mut iterated = Vec::new();
        while let Some((key, _)) = iter.entry() {
            iterated.push(crate::access::key::decode_i64(&key));
            iter.advance()?;
        }
        let expected: Vec<i64> = (0..200).filter(|k| k % 3 != 0).collect();
        assert_eq!(iterated, expected);
        Ok(())
    }

    #[test]
    fn test_root_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let config = small_config();

        {
            let disk = DiskManager::create(&path)?;
            let pool =
                BufferPoolManager::new(disk, Box::new(LruReplacer::new(config.pool_size)), &config);
            let tree =
                BTreeIndex::open("persistent", pool.clone(), Arc::new(MemcmpComparator), &config)?;
            for k in 1..=8i64 {
                tree.insert(&encode_i64(k), rid(k))?;
            }
            pool.flush_all()?;
        }

        let disk = DiskManager::open(&path)?;
        let pool =
            BufferPoolManager::new(disk, Box::new(LruReplacer::new(config.pool_size)), &config);
        let tree = BTreeIndex::open("persistent", pool, Arc::new(MemcmpComparator), &config)?;
        assert!(!tree.is_empty());
        for k in 1..=8i64 {
            assert_eq!(tree.get_value(&encode_i64(k))?, Some(rid(k)));
        }
        Ok(())
    }

    #[test]
    fn test_concurrent_inserts() -> Result<()> {
        use std::sync::Arc as StdArc;

        let config = StorageConfig {
            pool_size: 128,
            leaf_max_size: 8,
            internal_max_size: 8,
            ..Default::default()
        };
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool =
            BufferPoolManager::new(disk, Box::new(LruReplacer::new(config.pool_size)), &config);
        let tree = StdArc::new(BTreeIndex::open(
            "concurrent",
            pool,
            Arc::new(MemcmpComparator),
            &config,
        )?);

        let mut handles = vec![];
        for t in 0..4i64 {
            let tree = StdArc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 0..50i64 {
                    let k = t * 50 + i;
                    tree.insert(&encode_i64(k), Rid::new(PageId(k as u32), 0)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for k in 0..200i64 {
            assert_eq!(tree.get_value(&encode_i64(k))?, Some(rid(k)), "key {}", k);
        }
        Ok(())
    }
}
