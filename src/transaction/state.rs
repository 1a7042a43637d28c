//! Two-phase-locking transaction states.

/// Lifecycle of a transaction under strict two-phase locking: locks may
/// only be acquired while `Growing`; the first release moves the
/// transaction to `Shrinking`, and acquiring after that is an abort
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction may acquire locks.
    Growing,
    /// The transaction has released a lock and may only release more.
    Shrinking,
    /// The transaction finished successfully.
    Committed,
    /// The transaction was rolled back.
    Aborted,
}

impl TransactionState {
    pub fn is_growing(&self) -> bool {
        matches!(self, Self::Growing)
    }

    pub fn is_shrinking(&self) -> bool {
        matches!(self, Self::Shrinking)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// True once the transaction can take no further part in locking.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Growing => write!(f, "Growing"),
            Self::Shrinking => write!(f, "Shrinking"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}
