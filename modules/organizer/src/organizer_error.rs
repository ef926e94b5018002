//! Error types for organizer operations.

/// Errors returned by [`Organizer`](crate::chain_organizer::Organizer).
///
/// Every variant is fatal to the current run: the chain store either failed
/// or broke its contract, and continuing could corrupt the accepted chain.
#[derive(Debug, thiserror::Error)]
pub enum OrganizerError {
    /// The backing chain store failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    /// A candidate attaches above the current tip.
    #[error("fork index {fork_index} is beyond the chain tip {tip:?}")]
    ForkBeyondTip { fork_index: u64, tip: Option<u64> },

    /// The store's tail slice disagrees with its reported tip.
    #[error("tail above height {from_height} should hold {expected} blocks, got {got}")]
    TailLengthMismatch {
        from_height: u64,
        expected: u64,
        got: u64,
    },

    /// The store's tip is not where a mutation should have left it.
    #[error("chain tip should be {expected}, got {got:?}")]
    TipMismatch { expected: u64, got: Option<u64> },
}
