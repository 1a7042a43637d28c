pub mod btree;
pub mod hash;
pub mod key;
pub mod rid;

pub use btree::BTreeIndex;
pub use hash::LinearProbeHashTable;
pub use key::{KeyComparator, MemcmpComparator};
pub use rid::Rid;
