//! Pluggable verification and notification hooks for the organizer.

use keel_common::BlockHash;
use tracing::debug;

use crate::block_record::BlockRecordPtr;

/// Decides whether one block of a candidate chain is acceptable.
///
/// Called with the height the candidate attaches at, the whole candidate
/// (oldest first) and the index of the block being checked. Returning
/// `false` rejects that block and everything built on it. Implementations
/// must not depend on organizer state.
pub trait BlockVerifier {
    fn verify(&self, fork_index: u64, orphan_chain: &[BlockRecordPtr], orphan_index: usize)
        -> bool;
}

impl<F> BlockVerifier for F
where
    F: Fn(u64, &[BlockRecordPtr], usize) -> bool,
{
    fn verify(
        &self,
        fork_index: u64,
        orphan_chain: &[BlockRecordPtr],
        orphan_index: usize,
    ) -> bool {
        self(fork_index, orphan_chain, orphan_index)
    }
}

/// Callback receiver for chain changes.
///
/// Every call happens after the change is committed to the chain store.
/// Observers have no path back into the organizer, so any follow-on work
/// has to be queued.
pub trait ReorganizeObserver {
    /// The accepted chain switched to a heavier fork. Called exactly once
    /// per switch with both sequences oldest first.
    fn reorganize_occurred(&self, arrivals: &[BlockRecordPtr], replaced: &[BlockRecordPtr]);

    /// A block was appended directly at the tip.
    fn block_accepted(&self, _height: u64, _hash: BlockHash) {}

    /// A block failed verification and was discarded.
    fn block_rejected(&self, _hash: BlockHash) {}
}

/// Default verifier: checks the shape of the candidate, not consensus rules.
#[derive(Debug, Clone, Copy)]
pub struct StructuralVerifier {
    pub check_proof_of_work: bool,
}

impl Default for StructuralVerifier {
    fn default() -> Self {
        Self {
            check_proof_of_work: true,
        }
    }
}

impl BlockVerifier for StructuralVerifier {
    fn verify(
        &self,
        fork_index: u64,
        orphan_chain: &[BlockRecordPtr],
        orphan_index: usize,
    ) -> bool {
        let Some(record) = orphan_chain.get(orphan_index) else {
            return false;
        };

        // The root's link to the fork block was established by the lookup
        if orphan_index > 0 && record.previous_hash() != orphan_chain[orphan_index - 1].hash() {
            debug!(hash = %record.hash(), "Candidate block does not link to its predecessor");
            return false;
        }

        if record.work().is_zero() {
            debug!(hash = %record.hash(), "Candidate block has an invalid target");
            return false;
        }

        if self.check_proof_of_work && !record.block().header.meets_target() {
            debug!(
                hash = %record.hash(),
                height = fork_index + orphan_index as u64 + 1,
                "Candidate block does not meet its target"
            );
            return false;
        }

        true
    }
}
