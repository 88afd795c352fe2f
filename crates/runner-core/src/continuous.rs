//! Drives the non-speculative continuous-batching loop (§4.6): schedule →
//! execute → commit → respond, one tick at a time. The scheduler itself is
//! synchronous (§5: a single scheduler thread, no lock held across a
//! suspension); an async driver (see `runner-api`) owns the tick interval
//! and the per-tick admission timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use runner_backend::{OutputParameters, SamplingParams};
use runner_common::{Result, RunnerError};

use crate::batch::prepare_inputs;
use crate::block_manager::BlockManager;
use crate::engine::Engine;
use crate::policy::SchedulerPolicy;
use crate::sequence::{FinishReason, RequestId, Sequence, SequenceId, Stage};

/// Observes token-level progress as the scheduler commits output. Streaming
/// transports (SSE/websocket) implement this to emit deltas; tests use a
/// simple `Vec`-collecting implementation.
pub trait ResponseHandler: Send + Sync {
    fn on_token(&self, request_id: RequestId, seq_id: SequenceId, token: u32);
    fn on_finish(&self, request_id: RequestId, seq_id: SequenceId, token_ids: &[u32]);
}

/// A `ResponseHandler` that does nothing; useful for offline/batch callers
/// that only care about the final committed `token_ids` on each `Sequence`.
pub struct NullResponseHandler;
impl ResponseHandler for NullResponseHandler {
    fn on_token(&self, _request_id: RequestId, _seq_id: SequenceId, _token: u32) {}
    fn on_finish(&self, _request_id: RequestId, _seq_id: SequenceId, _token_ids: &[u32]) {}
}

struct ForkSpec {
    remaining: usize,
    sampling_params: SamplingParams,
    priority: u64,
}

#[derive(Default)]
pub struct TickReport {
    pub ran: Vec<SequenceId>,
    pub finished: Vec<SequenceId>,
    pub preempted: Vec<SequenceId>,
}

/// Owns one `Engine`, its `BlockManager`, the admission `SchedulerPolicy`,
/// and every in-flight `Sequence` (§4.6). `waiting` and `running` together
/// hold every non-finished sequence exactly once.
pub struct ContinuousScheduler {
    engine: Engine,
    block_manager: BlockManager,
    policy: SchedulerPolicy,
    waiting: VecDeque<Sequence>,
    running: Vec<Sequence>,
    pending_forks: HashMap<RequestId, ForkSpec>,
    next_seq_id: SequenceId,
    next_request_id: RequestId,
    response_handler: Arc<dyn ResponseHandler>,
    /// Consecutive recoverable tick failures (§7: OutOfBlocks/Device). Reset
    /// on any tick that completes a forward pass; a second one in a row
    /// degrades the engine instead of retrying a third time.
    consecutive_failures: usize,
    degraded: bool,
}

impl ContinuousScheduler {
    pub fn new(
        engine: Engine,
        block_manager: BlockManager,
        policy: SchedulerPolicy,
        response_handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            engine,
            block_manager,
            policy,
            waiting: VecDeque::new(),
            running: Vec::new(),
            pending_forks: HashMap::new(),
            next_seq_id: 0,
            next_request_id: 0,
            response_handler,
            consecutive_failures: 0,
            degraded: false,
        }
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Set once a second consecutive recoverable tick failure has drained
    /// every in-flight sequence (§7). A degraded scheduler still answers
    /// `tick()` calls but has nothing left to run.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Admits a new request of `n` sibling sequences sharing `prompt_tokens`
    /// (§3: Request). Only the parent runs prefill; siblings are forked
    /// from it via copy-on-write once the parent's first decode step lands
    /// (§4.2 fork).
    pub fn submit(&mut self, prompt_tokens: Vec<u32>, sampling_params: SamplingParams, n: usize, priority: u64) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let parent_id = self.next_seq_id;
        self.next_seq_id += 1;
        let parent = Sequence::new(parent_id, request_id, priority, prompt_tokens, sampling_params.clone());
        let num_prompt_tokens = parent.num_prompt_tokens;
        self.waiting.push_back(parent);
        if n > 1 {
            self.pending_forks.insert(request_id, ForkSpec { remaining: n - 1, sampling_params, priority });
        }
        tracing::info!(request_id, n, num_prompt_tokens, "request admitted to waiting queue");
        request_id
    }

    /// Runs one tick: pick a batch, forward+sample, commit tokens, evaluate
    /// stop conditions, emit deltas, release blocks of sequences that
    /// finished this tick (§4.6 steps 1-5).
    pub fn tick(&mut self) -> Result<TickReport> {
        let plan = self.policy.pick_batch(&self.waiting, &self.running, &self.block_manager);
        let mut report = TickReport { preempted: plan.preempted.clone(), ..Default::default() };

        for id in &plan.preempted {
            if let Some(pos) = self.running.iter().position(|s| s.id == *id) {
                let mut seq = self.running.remove(pos);
                self.block_manager.release(seq.id);
                seq.stage = Stage::Preempted;
                tracing::warn!(seq_id = seq.id, priority = seq.priority, "preempted for lack of free kv blocks");
                self.waiting.push_back(seq);
            }
        }

        if plan.batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(
            batch_size = plan.batch.len(),
            waiting = self.waiting.len(),
            free_blocks = self.block_manager.free_blocks(),
            "batch composed for this tick"
        );

        // Pull every batch member into one owned Vec, in the exact order
        // `execute_model`'s output is keyed by.
        let mut batch_seqs: Vec<Sequence> = Vec::with_capacity(plan.batch.len());
        for id in &plan.batch {
            if let Some(pos) = self.waiting.iter().position(|s| s.id == *id) {
                let mut seq = self.waiting.remove(pos).expect("position found above");
                if seq.stage == Stage::Preempted {
                    // Re-admission re-prefills from the recorded token_ids
                    // (§4.2 eviction policy): decode state was discarded,
                    // so this tick reprocesses the whole sequence.
                    seq.stage = Stage::Prefill;
                }
                batch_seqs.push(seq);
            } else if let Some(pos) = self.running.iter().position(|s| s.id == *id) {
                batch_seqs.push(self.running.remove(pos));
            }
        }

        let output = match self.run_batch(&batch_seqs) {
            Ok(output) => output,
            Err(err) => return self.handle_tick_failure(batch_seqs, err, report),
        };
        self.consecutive_failures = 0;

        let mut forked = Vec::new();
        for (seq, &token) in batch_seqs.iter_mut().zip(output.token_ids.iter()) {
            let was_prefill = seq.stage == Stage::Prefill;
            seq.append_token(token);
            seq.maybe_finish();
            report.ran.push(seq.id);
            self.response_handler.on_token(seq.request_id, seq.id, token);

            if was_prefill && seq.stage == Stage::Decode {
                if let Some(spec) = self.pending_forks.remove(&seq.request_id) {
                    for _ in 0..spec.remaining {
                        let child_id = self.next_seq_id;
                        self.next_seq_id += 1;
                        let mut child =
                            Sequence::new(child_id, seq.request_id, spec.priority, seq.token_ids.clone(), spec.sampling_params.clone());
                        child.stage = Stage::Decode;
                        self.block_manager.fork(seq.id, child_id);
                        forked.push(child);
                    }
                }
            }

            if seq.is_finished() {
                self.block_manager.release(seq.id);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
        }

        for seq in batch_seqs.into_iter() {
            if !seq.is_finished() {
                self.running.push(seq);
            }
        }
        self.running.extend(forked);

        Ok(report)
    }

    /// Allocates blocks for this tick's batch, splits off a private copy of
    /// any decode sequence's last block still shared with a fork sibling
    /// (§4.2 COW), then runs one forward+sample pass. Allocation and COW
    /// both mutate `block_manager` even on failure, so a caller that gets
    /// `Err` back must roll the pool state forward through
    /// `handle_tick_failure` rather than just dropping `batch_seqs`.
    fn run_batch(&mut self, batch_seqs: &[Sequence]) -> Result<OutputParameters> {
        for seq in batch_seqs {
            self.block_manager.allocate_for(seq.id, seq.num_tokens())?;
        }

        for seq in batch_seqs {
            if seq.stage != Stage::Decode {
                continue;
            }
            if let Some((old, new)) = self.block_manager.cow_last_block(seq.id)? {
                self.engine.copy_block(old, new)?;
            }
        }

        let refs: Vec<&Sequence> = batch_seqs.iter().collect();
        let input = prepare_inputs(&refs, &self.block_manager);
        let sampling: Vec<SamplingParams> = batch_seqs.iter().map(|s| s.sampling_params.clone()).collect();
        self.engine.execute_model(input, sampling)
    }

    /// Rolls a failed tick back to a consistent state instead of letting
    /// `batch_seqs` drop off the end of the stack with their blocks still
    /// held in `block_manager`'s tables. Recoverable errors (§7:
    /// OutOfBlocks/Device) requeue the batch for one retry next tick; a
    /// second consecutive recoverable failure marks the scheduler degraded
    /// and drains every in-flight sequence with `FinishReason::Aborted`
    /// rather than retrying forever. Non-recoverable errors terminate only
    /// this batch and propagate to the caller.
    fn handle_tick_failure(&mut self, batch_seqs: Vec<Sequence>, err: RunnerError, mut report: TickReport) -> Result<TickReport> {
        for seq in &batch_seqs {
            self.block_manager.release(seq.id);
        }

        if !err.is_recoverable() {
            for mut seq in batch_seqs {
                seq.stage = Stage::Finished;
                seq.finish_reason = Some(FinishReason::Aborted);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
            return Err(err);
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= 2 {
            tracing::error!(%err, "second consecutive tick failure, marking engine degraded and draining");
            self.degraded = true;
            let mut drained = batch_seqs;
            drained.extend(self.waiting.drain(..));
            drained.extend(self.running.drain(..));
            for mut seq in drained {
                self.block_manager.release(seq.id);
                seq.stage = Stage::Finished;
                seq.finish_reason = Some(FinishReason::Aborted);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
            return Ok(report);
        }

        tracing::warn!(%err, "tick failed, requeuing batch for one retry");
        for mut seq in batch_seqs {
            if seq.stage == Stage::Decode {
                // Decode state is lost along with its blocks; re-admission
                // re-prefills from the recorded token_ids (§4.2 eviction).
                seq.stage = Stage::Preempted;
            }
            self.waiting.push_back(seq);
        }
        Ok(report)
    }
}
