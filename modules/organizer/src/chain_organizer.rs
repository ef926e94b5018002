//! Chain selection and reorganization over an orphan pool.
//!
//! Blocks are processed one at a time from a FIFO queue. A block that
//! extends the tip is appended directly; anything else is buffered in the
//! orphan pool and traced back towards the accepted chain. Once a buffered
//! run attaches to the chain and carries strictly more work than the tail
//! it would displace, the tail is swapped out in one step and the displaced
//! blocks go back into the pool. On equal work the current chain stays.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use keel_common::{BlockHash, Work};
use tracing::{debug, info, warn};

use crate::{
    block_record::{BlockPlacement, BlockRecord, BlockRecordPtr},
    orphan_pool::OrphanPool,
    organizer_error::OrganizerError,
    organizer_hooks::{BlockVerifier, ReorganizeObserver},
    stores::ChainStore,
};

/// Single-writer organizer. `start` and `enqueue` take `&mut self`, so
/// only one run can be in flight per instance.
pub struct Organizer {
    /// Blocks not yet connected to the accepted chain.
    orphans: OrphanPool,
    /// Accepted chain, possibly shared with readers.
    chain: Arc<dyn ChainStore>,
    verifier: Box<dyn BlockVerifier + Send>,
    observer: Box<dyn ReorganizeObserver + Send>,
    /// Arrivals waiting for `start`.
    process_queue: VecDeque<BlockRecordPtr>,
    /// Set until the first run, and again whenever blocks are rejected or
    /// displaced, so the next run revisits unprocessed orphans.
    rescan_pool: bool,
}

impl Organizer {
    pub fn new(
        orphans: OrphanPool,
        chain: Arc<dyn ChainStore>,
        verifier: Box<dyn BlockVerifier + Send>,
        observer: Box<dyn ReorganizeObserver + Send>,
    ) -> Self {
        Self {
            orphans,
            chain,
            verifier,
            observer,
            process_queue: VecDeque::new(),
            rescan_pool: true,
        }
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.chain
    }

    /// Number of arrivals waiting to be processed.
    pub fn queued(&self) -> usize {
        self.process_queue.len()
    }

    /// Queue an arrival for the next `start`.
    pub fn enqueue(&mut self, block: BlockRecordPtr) {
        self.process_queue.push_back(block);
    }

    /// Drain the queue. The first run, and the first run after blocks were
    /// rejected or displaced, also revisits every unprocessed orphan.
    ///
    /// Stops at the first error, leaving the rest of the queue in place.
    pub fn start(&mut self) -> Result<(), OrganizerError> {
        if std::mem::take(&mut self.rescan_pool) {
            let queued: HashSet<BlockHash> =
                self.process_queue.iter().map(|record| record.hash()).collect();
            for record in self.orphans.unprocessed() {
                if !queued.contains(&record.hash()) {
                    self.process_queue.push_back(record);
                }
            }
        }

        while let Some(record) = self.process_queue.pop_front() {
            self.process(record)?;
        }
        Ok(())
    }

    fn process(&mut self, arrival: BlockRecordPtr) -> Result<(), OrganizerError> {
        let hash = arrival.hash();
        if arrival.placement() == BlockPlacement::Rejected {
            debug!(%hash, "Skipping rejected block");
            return Ok(());
        }

        if self.chain.find_index(&hash)?.is_some() {
            debug!(%hash, "Block already in chain");
            arrival.mark_processed();
            self.orphans.remove(&hash);
            return Ok(());
        }

        // Prefer the pooled copy, which carries the verification state
        let record = self.orphans.get(&hash).unwrap_or(arrival);
        if record.is_processed() {
            debug!(%hash, "Block already processed");
            return Ok(());
        }

        let tip = self.chain.tip()?;
        let parent_height = self.chain.find_index(&record.previous_hash())?;
        if let (Some(tip), Some(parent_height)) = (tip, parent_height) {
            if parent_height == tip && self.orphans.children(&hash).is_empty() {
                return self.attach_to_tip(record, tip);
            }
        }

        self.orphans.add(record);
        self.organize(&hash)
    }

    /// Append a block whose parent is the tip, without a reorganization.
    fn attach_to_tip(&mut self, record: BlockRecordPtr, tip: u64) -> Result<(), OrganizerError> {
        let hash = record.hash();
        if !record.is_verified() && !self.verifier.verify(tip, std::slice::from_ref(&record), 0) {
            self.clip_rejected(&record);
            return Ok(());
        }
        record.mark_verified();

        self.chain.add(record.clone())?;
        let height = tip + 1;
        let new_tip = self.chain.tip()?;
        if new_tip != Some(height) {
            return Err(OrganizerError::TipMismatch {
                expected: height,
                got: new_tip,
            });
        }

        record.set_placement(BlockPlacement::MainChain { height });
        record.mark_processed();
        self.orphans.remove(&hash);

        info!(%hash, height, "Block accepted at tip");
        self.observer.block_accepted(height, hash);
        Ok(())
    }

    /// Evaluate the candidate chains running through the pooled block
    /// `hash`, heaviest first. They share a fork point, so once the
    /// heaviest verified candidate loses none of the others can win.
    fn organize(&mut self, hash: &BlockHash) -> Result<(), OrganizerError> {
        loop {
            let mut candidates = self.candidates_through(hash).into_iter();
            let Some(best) = candidates.next() else {
                // Rejected along with an ancestor
                return Ok(());
            };
            let root_parent = best[0].previous_hash();

            let Some(fork_index) = self.chain.find_index(&root_parent)? else {
                debug!(%hash, missing = %root_parent, "Orphan awaiting ancestor");
                return Ok(());
            };
            let tip = self.chain.tip()?;
            if tip.map_or(true, |tip| fork_index > tip) {
                return Err(OrganizerError::ForkBeyondTip { fork_index, tip });
            }

            if !self.verify_chain(fork_index, &best) {
                // The pool changed, so plan again from what is left
                continue;
            }

            let candidate_work: Work = best.iter().map(|record| record.work().clone()).sum();
            let current_work = self.chain.end_slice_difficulty(fork_index)?;
            if candidate_work <= current_work {
                debug!(
                    fork_index,
                    length = best.len(),
                    %candidate_work,
                    %current_work,
                    "Candidate chain not heavier than current tail"
                );
                for record in best.into_iter().chain(candidates.flatten()) {
                    record.mark_processed();
                }
                return Ok(());
            }

            for record in &best {
                record.mark_processed();
            }

            // A lone block left on the tip once its descendants were rejected
            if best.len() == 1 && tip == Some(fork_index) {
                return self.attach_to_tip(best[0].clone(), fork_index);
            }
            return self.replace_chain(fork_index, best);
        }
    }

    /// Traces from every in-pool leaf descending from `hash`, heaviest
    /// first. Chains of equal work keep their arrival order.
    fn candidates_through(&self, hash: &BlockHash) -> Vec<Vec<BlockRecordPtr>> {
        let mut candidates: Vec<(Work, Vec<BlockRecordPtr>)> = self
            .orphans
            .descendant_tips(hash)
            .iter()
            .map(|tip| {
                let chain = self.orphans.trace(tip);
                let work = chain.iter().map(|record| record.work().clone()).sum();
                (work, chain)
            })
            .collect();
        candidates.sort_by(|(a, _), (b, _)| b.cmp(a));
        candidates.into_iter().map(|(_, chain)| chain).collect()
    }

    /// Run the verifier over `chain`, resuming at the first block not
    /// verified on an earlier pass. On failure the failing block and its
    /// pooled descendants are rejected.
    fn verify_chain(&mut self, fork_index: u64, chain: &[BlockRecordPtr]) -> bool {
        let orphan_index =
            chain.iter().position(|record| !record.is_verified()).unwrap_or(chain.len());

        for index in orphan_index..chain.len() {
            if !self.verifier.verify(fork_index, chain, index) {
                self.clip_rejected(&chain[index]);
                return false;
            }
            chain[index].mark_verified();
        }
        true
    }

    fn clip_rejected(&mut self, record: &BlockRecordPtr) {
        let hash = record.hash();
        self.orphans.remove(&hash);
        let mut rejected = vec![record.clone()];
        rejected.extend(self.orphans.remove_descendants(&hash));

        self.rescan_pool = true;
        for record in &rejected {
            record.mark_processed();
            record.set_placement(BlockPlacement::Rejected);
            warn!(hash = %record.hash(), "Block rejected");
            self.observer.block_rejected(record.hash());
        }
    }

    fn replace_chain(
        &mut self,
        fork_index: u64,
        chain: Vec<BlockRecordPtr>,
    ) -> Result<(), OrganizerError> {
        let tip = self.chain.tip()?;
        let expected = tip.map_or(0, |tip| tip.saturating_sub(fork_index));
        let replaced = self.chain.end_slice(fork_index)?;
        if replaced.len() as u64 != expected {
            return Err(OrganizerError::TailLengthMismatch {
                from_height: fork_index,
                expected,
                got: replaced.len() as u64,
            });
        }

        self.chain.replace_tail(fork_index, &chain)?;
        let new_tip = fork_index + chain.len() as u64;
        let got = self.chain.tip()?;
        if got != Some(new_tip) {
            return Err(OrganizerError::TipMismatch {
                expected: new_tip,
                got,
            });
        }

        self.clip_orphans(fork_index, &chain, &replaced);
        info!(
            fork_index,
            arrivals = chain.len(),
            replaced = replaced.len(),
            tip = new_tip,
            "Chain reorganized"
        );
        self.observer.reorganize_occurred(&chain, &replaced);
        Ok(())
    }

    /// Move the arrivals out of the pool and put the displaced blocks back
    /// in as fresh orphans. Arrivals go first so a full pool can never
    /// evict one of them.
    fn clip_orphans(
        &mut self,
        fork_index: u64,
        arrivals: &[BlockRecordPtr],
        replaced: &[BlockRecordPtr],
    ) {
        for (offset, record) in arrivals.iter().enumerate() {
            self.orphans.remove(&record.hash());
            record.set_placement(BlockPlacement::MainChain {
                height: fork_index + 1 + offset as u64,
            });
        }

        for record in replaced {
            self.orphans.add(Arc::new(BlockRecord::from_arc(record.block_ptr())));
            self.rescan_pool = true;
        }
    }
}
