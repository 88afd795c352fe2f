//! Continuous-batching admission policy (§4.5): picks the next batch from a
//! waiting queue plus currently-running sequences, subject to
//! `max_tokens_per_batch` / `max_seqs_per_batch` / block availability, and
//! preempts the lowest-priority running sequences when decode admission
//! would exceed block capacity.

use std::collections::VecDeque;

use crate::block_manager::BlockManager;
use crate::sequence::{Sequence, SequenceId, Stage};

/// The outcome of one `pick_batch` call: which sequences run this tick, and
/// which running sequences were preempted and must re-enter the waiting
/// queue.
pub struct BatchPlan {
    pub batch: Vec<SequenceId>,
    pub preempted: Vec<SequenceId>,
}

pub struct SchedulerPolicy {
    max_tokens_per_batch: usize,
    max_seqs_per_batch: usize,
}

impl SchedulerPolicy {
    pub fn new(max_tokens_per_batch: usize, max_seqs_per_batch: usize) -> Self {
        Self { max_tokens_per_batch, max_seqs_per_batch }
    }

    /// `waiting` is a priority-ordered (then FIFO-by-arrival, §4.5) queue of
    /// sequences not currently running; `running` are the sequences that
    /// executed last tick. Admits running DECODE sequences first (they
    /// carry exactly one token each), then fills remaining budget with
    /// fresh PREFILL sequences from `waiting` subject to block
    /// availability. When DECODE admission alone would exceed block
    /// capacity, preempts the lowest-priority running sequences until it
    /// fits.
    pub fn pick_batch(
        &self,
        waiting: &VecDeque<Sequence>,
        running: &[Sequence],
        block_manager: &BlockManager,
    ) -> BatchPlan {
        let mut preempted = Vec::new();
        let mut admitted_tokens = 0usize;
        let mut admitted_seqs = 0usize;
        let mut batch = Vec::new();

        // Running DECODE sequences are prioritized: each needs at most one
        // new block (its last one may already have a free slot). Sort
        // ascending priority value = highest priority first; ties broken by
        // arrival order implicit in `running`'s existing order.
        let mut to_admit: Vec<&Sequence> = running.iter().filter(|s| s.stage == Stage::Decode).collect();
        to_admit.sort_by_key(|s| s.priority);

        // Preempt from the tail (lowest priority = highest `priority`
        // value) until every remaining decode sequence can get a block.
        while !fits_decode_admission(&to_admit, block_manager) {
            match to_admit.pop() {
                Some(victim) => preempted.push(victim.id),
                None => break,
            }
        }

        for seq in to_admit {
            if admitted_seqs >= self.max_seqs_per_batch || admitted_tokens >= self.max_tokens_per_batch {
                preempted.push(seq.id);
                continue;
            }
            batch.push(seq.id);
            admitted_tokens += 1;
            admitted_seqs += 1;
        }

        // Fill remaining budget with fresh PREFILL sequences, FIFO within
        // priority (§4.5 tie-break), subject to block availability. Blocks
        // tentatively claimed by sequences admitted earlier in this same
        // loop must be deducted before checking the next candidate —
        // `block_manager.free_blocks()` never changes until the scheduler
        // actually applies the plan, so without a running reservation
        // counter every candidate would be checked against the same static
        // free count and several could pass who collectively don't fit.
        let block_size = block_manager.block_size().max(1);
        let mut reserved_blocks = 0usize;
        let mut ordered_waiting: Vec<&Sequence> = waiting.iter().collect();
        ordered_waiting.sort_by_key(|s| (s.priority, s.request_id));
        for seq in ordered_waiting {
            if admitted_seqs >= self.max_seqs_per_batch {
                break;
            }
            // There is no chunked-prefill cursor in this design: a PREFILL
            // sequence always forwards every position it currently holds
            // (`batch.rs`'s `prepare_inputs` starts at 0 for `Stage::Prefill`),
            // including a re-admitted-after-preemption sequence whose
            // `token_ids` already holds tokens decoded before preemption.
            // `num_prompt_tokens` alone would undercount that case.
            let contribution = seq.num_tokens().max(1);
            if admitted_tokens + contribution > self.max_tokens_per_batch {
                continue;
            }
            let needed_blocks = (seq.num_tokens() + block_size - 1) / block_size;
            if needed_blocks > block_manager.free_blocks().saturating_sub(reserved_blocks) {
                continue;
            }
            batch.push(seq.id);
            admitted_tokens += contribution;
            admitted_seqs += 1;
            reserved_blocks += needed_blocks;
        }

        BatchPlan { batch, preempted }
    }
}

/// Whether every sequence in `candidates` could get the one extra block a
/// decode step might need, given the pool's current free count.
fn fits_decode_admission(candidates: &[&Sequence], block_manager: &BlockManager) -> bool {
    let mut needed = 0usize;
    for seq in candidates {
        if seq.num_tokens() % block_manager.block_size().max(1) == 0 {
            needed += 1;
        }
    }
    needed <= block_manager.free_blocks()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::SamplingParams;

    fn seq(id: SequenceId, priority: u64, tokens: usize, stage: Stage) -> Sequence {
        let mut s = Sequence::new(id, id, priority, vec![0; tokens], SamplingParams::default());
        s.stage = stage;
        s
    }

    #[test]
    fn admits_decode_before_prefill() {
        let policy = SchedulerPolicy::new(1000, 10);
        let mgr = BlockManager::new(16, 10);
        let running = vec![seq(1, 0, 16, Stage::Decode)];
        let mut waiting = VecDeque::new();
        waiting.push_back(seq(2, 0, 8, Stage::Prefill));
        let plan = policy.pick_batch(&waiting, &running, &mgr);
        assert_eq!(plan.batch, vec![1, 2]);
        assert!(plan.preempted.is_empty());
    }

    #[test]
    fn preempts_lowest_priority_when_blocks_run_out() {
        let policy = SchedulerPolicy::new(1000, 10);
        let mut mgr = BlockManager::new(16, 2);
        // seed two running sequences that each exactly fill one block
        // (so their next decode token needs a fresh block).
        mgr.allocate_for(1, 16).unwrap();
        mgr.allocate_for(2, 16).unwrap();
        assert_eq!(mgr.free_blocks(), 0);
        let running = vec![seq(1, 0, 16, Stage::Decode), seq(2, 1, 16, Stage::Decode)];
        let waiting = VecDeque::new();
        let plan = policy.pick_batch(&waiting, &running, &mgr);
        assert_eq!(plan.preempted, vec![2], "higher-priority-value sequence preempted first");
        assert_eq!(plan.batch, vec![1]);
    }

    #[test]
    fn fifo_tie_break_within_same_priority() {
        let policy = SchedulerPolicy::new(1000, 10);
        let mgr = BlockManager::new(16, 10);
        let mut waiting = VecDeque::new();
        waiting.push_back(seq(5, 0, 4, Stage::Prefill));
        waiting.push_back(seq(3, 0, 4, Stage::Prefill));
        let running = [];
        let plan = policy.pick_batch(&waiting, &running, &mgr);
        // both priority 0; request_id tie-break keeps VecDeque (arrival)
        // order since request_id == id here and 3 < 5, so 3 sorts first.
        assert_eq!(plan.batch, vec![3, 5]);
    }

    #[test]
    fn prefill_admission_tracks_cumulative_block_reservation_not_just_static_free_count() {
        // Two waiting prefill sequences, each needing exactly one block,
        // against a pool with only one free block. Checking each candidate
        // against the pool's unchanged `free_blocks()` would admit both
        // (1 <= 1 passes twice); the second must be deferred instead.
        let policy = SchedulerPolicy::new(1000, 10);
        let mgr = BlockManager::new(16, 1);
        let mut waiting = VecDeque::new();
        waiting.push_back(seq(1, 0, 16, Stage::Prefill));
        waiting.push_back(seq(2, 1, 16, Stage::Prefill));
        let running = [];
        let plan = policy.pick_batch(&waiting, &running, &mgr);
        assert_eq!(plan.batch, vec![1], "second sequence has no block left to reserve");
    }

    #[test]
    fn respects_max_seqs_per_batch() {
        let policy = SchedulerPolicy::new(1000, 1);
        let mgr = BlockManager::new(16, 10);
        let mut waiting = VecDeque::new();
        waiting.push_back(seq(1, 0, 4, Stage::Prefill));
        waiting.push_back(seq(2, 0, 4, Stage::Prefill));
        let running = [];
        let plan = policy.pick_batch(&waiting, &running, &mgr);
        assert_eq!(plan.batch.len(), 1);
    }
}
