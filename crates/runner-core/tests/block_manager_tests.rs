//! Cross-module behavior between `BlockManager` and `SchedulerPolicy`:
//! admission respects live block occupancy, not just a static budget.

use runner_backend::SamplingParams;
use runner_core::{BlockManager, SchedulerPolicy, Sequence, Stage};
use std::collections::VecDeque;

fn seq(id: u64, priority: u64, tokens: usize, stage: Stage) -> Sequence {
    let mut s = Sequence::new(id, id, priority, vec![0; tokens], SamplingParams::default());
    s.stage = stage;
    s
}

#[test]
fn prefill_admission_backs_off_once_the_pool_is_exhausted() {
    let mut mgr = BlockManager::new(16, 2);
    mgr.allocate_for(100, 16).unwrap(); // pretend sequence 100 already holds the only other block
    assert_eq!(mgr.free_blocks(), 1);

    let policy = SchedulerPolicy::new(1024, 32);
    let mut waiting = VecDeque::new();
    waiting.push_back(seq(1, 0, 16, Stage::Prefill)); // fits in the one remaining block
    waiting.push_back(seq(2, 0, 32, Stage::Prefill)); // needs two, can't fit
    let plan = policy.pick_batch(&waiting, &[], &mgr);

    assert_eq!(plan.batch, vec![1], "second sequence should be deferred for lack of blocks");
}

#[test]
fn decode_admission_preempts_and_the_freed_block_unblocks_prefill_next_tick() {
    let mut mgr = BlockManager::new(16, 1);
    mgr.allocate_for(1, 16).unwrap(); // exactly fills the one block; next decode token needs a new one
    assert_eq!(mgr.free_blocks(), 0);

    let policy = SchedulerPolicy::new(1024, 32);
    let running = vec![seq(1, 5, 16, Stage::Decode)];
    let mut waiting = VecDeque::new();
    waiting.push_back(seq(2, 0, 4, Stage::Prefill));

    // Tick N: the plan only decides who must yield; the block isn't
    // actually released until the scheduler applies it.
    let plan = policy.pick_batch(&waiting, &running, &mgr);
    assert_eq!(plan.preempted, vec![1], "the only running sequence must yield its block");
    assert!(!plan.batch.contains(&2), "block is still held until the scheduler applies the preemption");

    // Tick N+1: scheduler has since released sequence 1's block.
    mgr.release(1);
    let plan = policy.pick_batch(&waiting, &[], &mgr);
    assert!(plan.batch.contains(&2), "prefill can now proceed with the freed block");
}
