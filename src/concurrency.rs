pub mod lock;

pub use lock::{AbortReason, LockManager, LockMode, TransactionAbortError};
