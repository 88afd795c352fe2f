//! Two-engine speculative decoding (§4.7): a small draft engine proposes `k`
//! tokens per tick, the target engine verifies all `k+1` candidate positions
//! in one forward pass, and an accept/reject walk decides how much of the
//! draft's guess survives. Mirrors `ContinuousScheduler`'s admission and
//! bookkeeping but keeps two independent block managers in lockstep.

use std::collections::VecDeque;

use rand::SeedableRng;
use rand::rngs::StdRng;
use runner_backend::{InputParameters, SamplingParams};
use runner_common::{Result, RunnerError};

use crate::batch::{physical_slot, prepare_inputs};
use crate::block_manager::BlockManager;
use crate::continuous::ResponseHandler;
use crate::engine::Engine;
use crate::policy::SchedulerPolicy;
use crate::sampler;
use crate::sequence::{FinishReason, RequestId, Sequence, SequenceId, Stage};

#[derive(Default)]
pub struct SpecTickReport {
    pub committed: Vec<SequenceId>,
    pub finished: Vec<SequenceId>,
    pub preempted: Vec<SequenceId>,
    pub draft_degraded: bool,
    pub accepted_tokens: usize,
    pub rejected_tokens: usize,
}

/// Owns the target (`llm`) and draft (`ssm`) engines, one `BlockManager`
/// each, and every in-flight `Sequence`. Admission is judged solely against
/// the target's block manager (§4.7: "policy picks against target's block
/// manager"); the draft's table always mirrors whatever the target holds
/// plus however many speculative tokens are currently tentative.
pub struct SpeculativeScheduler {
    target_engine: Engine,
    draft_engine: Engine,
    target_blocks: BlockManager,
    draft_blocks: BlockManager,
    policy: SchedulerPolicy,
    waiting: VecDeque<Sequence>,
    running: Vec<Sequence>,
    k: usize,
    next_seq_id: SequenceId,
    next_request_id: RequestId,
    response_handler: std::sync::Arc<dyn ResponseHandler>,
    /// Consecutive recoverable tick failures (§7). Mirrors
    /// `ContinuousScheduler`'s counter: reset on any tick that completes,
    /// degrades the scheduler on the second one in a row.
    consecutive_failures: usize,
    degraded: bool,
}

impl SpeculativeScheduler {
    pub fn new(
        target_engine: Engine,
        draft_engine: Engine,
        target_blocks: BlockManager,
        draft_blocks: BlockManager,
        policy: SchedulerPolicy,
        k: usize,
        response_handler: std::sync::Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            target_engine,
            draft_engine,
            target_blocks,
            draft_blocks,
            policy,
            waiting: VecDeque::new(),
            running: Vec::new(),
            k,
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

    /// Set once a second consecutive recoverable tick failure has drained
    /// every in-flight sequence (§7).
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn submit(&mut self, prompt_tokens: Vec<u32>, sampling_params: SamplingParams, priority: u64) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.waiting.push_back(Sequence::new(seq_id, request_id, priority, prompt_tokens, sampling_params));
        tracing::info!(request_id, "request admitted to speculative waiting queue");
        request_id
    }

    pub fn tick(&mut self) -> Result<SpecTickReport> {
        let plan = self.policy.pick_batch(&self.waiting, &self.running, &self.target_blocks);
        let mut report = SpecTickReport { preempted: plan.preempted.clone(), ..Default::default() };

        for id in &plan.preempted {
            if let Some(pos) = self.running.iter().position(|s| s.id == *id) {
                let mut seq = self.running.remove(pos);
                self.target_blocks.release(seq.id);
                self.draft_blocks.release(seq.id);
                seq.stage = Stage::Preempted;
                seq.proposed_tokens.clear();
                seq.proposed_distributions.clear();
                tracing::warn!(seq_id = seq.id, priority = seq.priority, "preempted for lack of free target-side kv blocks");
                self.waiting.push_back(seq);
            }
        }

        if plan.batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(batch_size = plan.batch.len(), waiting = self.waiting.len(), k = self.k, "speculative batch composed for this tick");

        let mut batch_seqs: Vec<Sequence> = Vec::with_capacity(plan.batch.len());
        for id in &plan.batch {
            if let Some(pos) = self.waiting.iter().position(|s| s.id == *id) {
                let mut seq = self.waiting.remove(pos).expect("position found above");
                if seq.stage == Stage::Preempted {
                    seq.stage = Stage::Prefill;
                }
                batch_seqs.push(seq);
            } else if let Some(pos) = self.running.iter().position(|s| s.id == *id) {
                batch_seqs.push(self.running.remove(pos));
            }
        }

        if let Err(err) = self.allocate_for_batch(&batch_seqs) {
            return self.handle_tick_failure(batch_seqs, err, report);
        }

        let (mut prefill_seqs, mut decode_seqs): (Vec<Sequence>, Vec<Sequence>) =
            batch_seqs.into_iter().partition(|s| s.stage == Stage::Prefill);

        if let Err(err) = self.run_prefill(&mut prefill_seqs, &mut report) {
            // Nothing committed yet in either sub-batch; roll both back.
            let mut failed = prefill_seqs;
            failed.extend(decode_seqs);
            return self.handle_tick_failure(failed, err, report);
        }

        let degraded = match self.run_speculative_decode(&mut decode_seqs, &mut report) {
            Ok(degraded) => degraded,
            Err(err) => {
                // The prefill sub-batch already committed successfully this
                // tick; keep it running. `run_speculative_decode` rolls
                // `decode_seqs` back to each sequence's pre-verify anchor
                // length on error, so it's safe to requeue as-is.
                for seq in prefill_seqs {
                    self.running.push(seq);
                }
                return self.handle_tick_failure(decode_seqs, err, report);
            }
        };
        report.draft_degraded = degraded;
        self.consecutive_failures = 0;

        for seq in prefill_seqs.into_iter().chain(decode_seqs.into_iter()) {
            if seq.is_finished() {
                // already released and reported in the helpers below.
                continue;
            }
            self.running.push(seq);
        }

        Ok(report)
    }

    fn allocate_for_batch(&mut self, batch_seqs: &[Sequence]) -> Result<()> {
        for seq in batch_seqs {
            self.target_blocks.allocate_for(seq.id, seq.num_tokens())?;
            self.draft_blocks.allocate_for(seq.id, seq.num_tokens())?;
        }
        Ok(())
    }

    /// Rolls a failed tick back instead of letting `batch_seqs` drop with
    /// their blocks still held in both block managers' tables. Recoverable
    /// errors (§7: OutOfBlocks/Device/Protocol) requeue the batch for one
    /// retry; a second consecutive recoverable failure marks the scheduler
    /// degraded and drains every in-flight sequence with
    /// `FinishReason::Aborted`. Non-recoverable errors terminate only this
    /// batch and propagate.
    fn handle_tick_failure(&mut self, batch_seqs: Vec<Sequence>, err: RunnerError, mut report: SpecTickReport) -> Result<SpecTickReport> {
        for seq in &batch_seqs {
            self.target_blocks.release(seq.id);
            self.draft_blocks.release(seq.id);
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
            tracing::error!(%err, "second consecutive tick failure, marking speculative scheduler degraded and draining");
            self.degraded = true;
            let mut drained = batch_seqs;
            drained.extend(self.waiting.drain(..));
            drained.extend(self.running.drain(..));
            for mut seq in drained {
                self.target_blocks.release(seq.id);
                self.draft_blocks.release(seq.id);
                seq.stage = Stage::Finished;
                seq.finish_reason = Some(FinishReason::Aborted);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
            return Ok(report);
        }

        tracing::warn!(%err, "tick failed, requeuing batch for one retry");
        for mut seq in batch_seqs {
            seq.proposed_tokens.clear();
            seq.proposed_distributions.clear();
            if seq.stage == Stage::Decode {
                seq.stage = Stage::Preempted;
            }
            self.waiting.push_back(seq);
        }
        Ok(report)
    }

    /// Prompt processing always runs on the target alone; the draft engine
    /// also forwards over the prompt (discarding its output) purely to
    /// populate its own KV cache, since speculation only starts once both
    /// engines hold the prompt's keys/values.
    fn run_prefill(&mut self, seqs: &mut Vec<Sequence>, report: &mut SpecTickReport) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let refs: Vec<&Sequence> = seqs.iter().collect();
        let target_input = prepare_inputs(&refs, &self.target_blocks);
        let draft_input = prepare_inputs(&refs, &self.draft_blocks);
        let sampling: Vec<SamplingParams> = seqs.iter().map(|s| s.sampling_params.clone()).collect();

        let _ = self.draft_engine.validate(draft_input, sampling.clone());
        let output = self.target_engine.execute_model(target_input, sampling)?;

        for (seq, &token) in seqs.iter_mut().zip(output.token_ids.iter()) {
            seq.append_token(token);
            seq.maybe_finish();
            report.committed.push(seq.id);
            self.response_handler.on_token(seq.request_id, seq.id, token);
            if seq.is_finished() {
                self.target_blocks.release(seq.id);
                self.draft_blocks.release(seq.id);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
        }
        seqs.retain(|s| !s.is_finished());
        Ok(())
    }

    /// Runs `self.k` draft steps for every still-decoding sequence, then one
    /// target verify forward over all `k+1` candidate positions, then the
    /// per-sequence accept/reject walk. Returns whether the draft cohort
    /// degraded to K'=0 this tick (a single draft forward failure aborts
    /// speculation for the whole cohort, not just one sequence — the draft
    /// steps are one batched call, not N independent ones).
    fn run_speculative_decode(&mut self, seqs: &mut Vec<Sequence>, report: &mut SpecTickReport) -> Result<bool> {
        if seqs.is_empty() {
            return Ok(false);
        }
        let anchor_lens: Vec<usize> = seqs.iter().map(|s| s.num_tokens()).collect();
        let mut rng = StdRng::from_entropy();

        let mut effective_k = self.k;
        if effective_k > 0 {
            if let Err(err) = self.run_draft_steps(seqs, effective_k) {
                tracing::warn!(%err, "draft proposal failed, degrading to K'=0 for this tick");
                for (seq, &anchor_len) in seqs.iter_mut().zip(anchor_lens.iter()) {
                    seq.token_ids.truncate(anchor_len);
                    seq.proposed_tokens.clear();
                    seq.proposed_distributions.clear();
                    self.draft_blocks.truncate_to(seq.id, anchor_len);
                }
                effective_k = 0;
            }
        }

        let distributions = match self.run_verify(seqs, &anchor_lens, effective_k) {
            Ok(d) => d,
            Err(err) => {
                // Nothing committed yet for this cohort; undo the draft
                // proposal's tentative token_ids/blocks the same way the
                // draft-failure degrade path above does, so a caller that
                // requeues `seqs` after this `Err` hands back clean state.
                for (seq, &anchor_len) in seqs.iter_mut().zip(anchor_lens.iter()) {
                    seq.token_ids.truncate(anchor_len);
                    seq.proposed_tokens.clear();
                    seq.proposed_distributions.clear();
                    self.target_blocks.truncate_to(seq.id, anchor_len);
                    self.draft_blocks.truncate_to(seq.id, anchor_len);
                }
                return Err(err);
            }
        };

        let mut offset = 0usize;
        for (seq, &anchor_len) in seqs.iter_mut().zip(anchor_lens.iter()) {
            let window = effective_k + 1;
            let p = &distributions[offset..offset + window];
            offset += window;

            let mut committed: Vec<u32> = Vec::with_capacity(window);
            if effective_k == 0 {
                committed.push(sampler::sample_from_distribution(&mut rng, &p[0]) as u32);
            } else {
                let mut accepted = 0usize;
                while accepted < effective_k {
                    let token = seq.proposed_tokens[accepted] as usize;
                    let q = &seq.proposed_distributions[accepted];
                    if sampler::accept_proposed_token(&mut rng, &p[accepted], q, token) {
                        committed.push(token as u32);
                        accepted += 1;
                    } else {
                        committed.push(sampler::sample_residual(&mut rng, &p[accepted], q) as u32);
                        break;
                    }
                }
                if accepted == effective_k {
                    committed.push(sampler::sample_from_distribution(&mut rng, &p[effective_k]) as u32);
                }
                seq.num_validated = accepted;
                report.accepted_tokens += accepted;
                if accepted < effective_k {
                    report.rejected_tokens += 1;
                }
            }

            // A stop token mid-commit ends the sequence at that point;
            // later tentative tokens in `committed` never happened.
            if let Some(cut) = committed.iter().position(|t| seq.sampling_params.stop_token_ids.contains(t)) {
                committed.truncate(cut + 1);
            }

            seq.token_ids.truncate(anchor_len);
            seq.token_ids.extend_from_slice(&committed);
            seq.proposed_tokens.clear();
            seq.proposed_distributions.clear();
            seq.maybe_finish();

            let new_len = seq.num_tokens();
            self.target_blocks.truncate_to(seq.id, new_len);
            self.draft_blocks.truncate_to(seq.id, new_len);

            for &token in &committed {
                report.committed.push(seq.id);
                self.response_handler.on_token(seq.request_id, seq.id, token);
            }
            if seq.is_finished() {
                self.target_blocks.release(seq.id);
                self.draft_blocks.release(seq.id);
                report.finished.push(seq.id);
                self.response_handler.on_finish(seq.request_id, seq.id, &seq.token_ids);
            }
        }
        seqs.retain(|s| !s.is_finished());
        Ok(effective_k == 0 && self.k > 0)
    }

    /// Allocates the target's blocks for the verify window, builds the
    /// verify-forward input, and returns the per-position distributions.
    /// Target allocation must cover the longest candidate window before the
    /// verify forward writes KV for it.
    fn run_verify(&mut self, seqs: &[Sequence], anchor_lens: &[usize], effective_k: usize) -> Result<Vec<Vec<f32>>> {
        for (seq, &anchor_len) in seqs.iter().zip(anchor_lens.iter()) {
            self.target_blocks.allocate_for(seq.id, anchor_len + effective_k)?;
        }

        let windows: Vec<(usize, usize)> = anchor_lens.iter().map(|&len| (len - 1, effective_k + 1)).collect();
        let refs: Vec<&Sequence> = seqs.iter().collect();
        let verify_input = prepare_verify_inputs(&refs, &windows, &self.target_blocks);
        let sampling: Vec<SamplingParams> = seqs.iter().map(|s| s.sampling_params.clone()).collect();
        let output = self.target_engine.validate(verify_input, sampling)?;
        output
            .distributions
            .ok_or_else(|| RunnerError::Protocol("target verify forward returned no distributions".into()))
    }

    /// Runs `k` sequential single-token draft decode steps over `seqs`,
    /// recording each step's sampled token and the distribution it was
    /// sampled from (`q_i(t)`) on every sequence. All `k` steps share one
    /// batched forward call per step across the whole cohort.
    fn run_draft_steps(&mut self, seqs: &mut [Sequence], k: usize) -> Result<()> {
        let mut rng = StdRng::from_entropy();
        for _ in 0..k {
            let refs: Vec<&Sequence> = seqs.iter().collect();
            let input = prepare_inputs(&refs, &self.draft_blocks);
            let sampling: Vec<SamplingParams> = seqs.iter().map(|s| s.sampling_params.clone()).collect();
            let output = self.draft_engine.validate(input, sampling)?;
            let distributions = output
                .distributions
                .ok_or_else(|| RunnerError::Protocol("draft step returned no distribution".into()))?;

            for (seq, q) in seqs.iter_mut().zip(distributions.into_iter()) {
                let token = sampler::sample_from_distribution(&mut rng, &q);
                seq.proposed_tokens.push(token as u32);
                seq.proposed_distributions.push(q);
                seq.token_ids.push(token as u32);
                self.draft_blocks.allocate_for(seq.id, seq.num_tokens())?;
            }
        }
        Ok(())
    }
}

/// Builds `InputParameters` for a verify forward: each sequence contributes
/// exactly `windows[i].1` tokens starting at logical position
/// `windows[i].0`, rather than the whole prompt or the single last token
/// `prepare_inputs` assumes.
fn prepare_verify_inputs(sequences: &[&Sequence], windows: &[(usize, usize)], block_manager: &BlockManager) -> InputParameters {
    let mut flatten_token_ids = Vec::new();
    let mut flatten_positions = Vec::new();
    let mut cu_seqlens = vec![0u32];
    let mut block_tables = Vec::with_capacity(sequences.len());
    let mut slot_mapping = Vec::new();
    let mut last_token_idxes = Vec::with_capacity(sequences.len());

    let block_size = block_manager.block_size();
    for (seq, &(start, count)) in sequences.iter().zip(windows.iter()) {
        let table = block_manager.block_table(seq.id);
        for position in start..start + count {
            flatten_token_ids.push(seq.token_ids[position]);
            flatten_positions.push(position as u32);
            slot_mapping.push(physical_slot(table, block_size, position));
        }
        last_token_idxes.push(flatten_token_ids.len() - 1);
        cu_seqlens.push(flatten_token_ids.len() as u32);
        block_tables.push(table.iter().map(|&b| b as i64).collect());
    }

    InputParameters {
        flatten_token_ids,
        flatten_positions,
        cu_seqlens,
        block_tables,
        slot_mapping,
        last_token_idxes,
        all_prefill_sequences: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuous::NullResponseHandler;
    use runner_backend::mock::MockModel;
    use runner_backend::{ModelArgs, QuantArgs};
    use std::sync::{Arc, Once};

    fn ensure_mock_registered() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| MockModel::register(runner_backend::global_registry()));
    }

    fn build_scheduler(k: usize) -> SpeculativeScheduler {
        ensure_mock_registered();
        let args = ModelArgs { vocab_size: 64, hidden_size: 8, n_layers: 1, n_heads: 1, n_kv_heads: None, dtype: "auto".into() };
        let target = Engine::init("mock", args.clone(), QuantArgs::default(), 1, None).unwrap();
        target.init_kv_cache(8).unwrap();
        let draft = Engine::init("mock", args, QuantArgs::default(), 1, None).unwrap();
        draft.init_kv_cache(8).unwrap();
        let target_blocks = BlockManager::new(16, 8);
        let draft_blocks = BlockManager::new(16, 8);
        let policy = SchedulerPolicy::new(1024, 32);
        SpeculativeScheduler::new(target, draft, target_blocks, draft_blocks, policy, k, Arc::new(NullResponseHandler))
    }

    #[test]
    fn prefill_tick_populates_both_engines_and_transitions_to_decode() {
        let mut sched = build_scheduler(2);
        let params = SamplingParams { max_tokens: 10, ..Default::default() };
        sched.submit(vec![1, 2, 3], params, 0);
        let report = sched.tick().unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(sched.running_len(), 1);
    }

    #[test]
    fn full_acceptance_commits_k_plus_one_tokens_in_one_tick() {
        let mut sched = build_scheduler(2);
        let params = SamplingParams { max_tokens: 20, ..Default::default() };
        sched.submit(vec![1, 2, 3], params, 0);
        sched.tick().unwrap(); // prefill
        let report = sched.tick().unwrap(); // first decode+speculate tick
        assert!(report.committed.len() >= 1, "at least the degrade-path single token should commit");
    }

    #[test]
    fn recoverable_tick_failure_requeues_batch_and_releases_both_block_managers() {
        let mut sched = build_scheduler(2);
        let mut seq = Sequence::new(1, 1, 0, vec![0; 16], SamplingParams::default());
        seq.stage = Stage::Decode;
        sched.target_blocks.allocate_for(seq.id, seq.num_tokens()).unwrap();
        sched.draft_blocks.allocate_for(seq.id, seq.num_tokens()).unwrap();
        assert_eq!(sched.target_blocks.free_blocks(), 7);
        assert_eq!(sched.draft_blocks.free_blocks(), 7);

        let report = sched
            .handle_tick_failure(vec![seq], RunnerError::Device { rank: 0, message: "timeout".into() }, SpecTickReport::default())
            .unwrap();

        assert!(report.finished.is_empty());
        assert_eq!(sched.target_blocks.free_blocks(), 8, "target blocks released, not leaked");
        assert_eq!(sched.draft_blocks.free_blocks(), 8, "draft blocks released, not leaked");
        assert_eq!(sched.waiting_len(), 1);
        assert!(!sched.is_degraded());
    }

    #[test]
    fn second_consecutive_recoverable_failure_degrades_and_drains() {
        let mut sched = build_scheduler(2);
        let seq_a = Sequence::new(1, 1, 0, vec![0; 8], SamplingParams::default());
        let seq_b = Sequence::new(2, 2, 0, vec![0; 8], SamplingParams::default());
        sched.waiting.push_back(Sequence::new(3, 3, 0, vec![0; 8], SamplingParams::default()));

        let protocol_err = || RunnerError::Protocol("draft/target disagreement".into());
        let report = sched.handle_tick_failure(vec![seq_a], protocol_err(), SpecTickReport::default()).unwrap();
        assert!(!sched.is_degraded());

        let report = sched.handle_tick_failure(vec![seq_b], protocol_err(), report).unwrap();
        assert!(sched.is_degraded());
        assert_eq!(sched.waiting_len(), 0);
        assert_eq!(sched.running_len(), 0);
        assert_eq!(report.finished.len(), 3);
    }

    #[test]
    fn sequence_eventually_finishes_on_max_tokens() {
        let mut sched = build_scheduler(2);
        let params = SamplingParams { max_tokens: 3, ..Default::default() };
        sched.submit(vec![1, 2, 3], params, 0);
        let mut finished = false;
        for _ in 0..10 {
            let report = sched.tick().unwrap();
            if !report.finished.is_empty() {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(sched.running_len(), 0);
    }
}
