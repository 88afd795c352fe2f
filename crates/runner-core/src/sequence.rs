//! Per-stream generation state (§3).

use runner_backend::SamplingParams;

pub type SequenceId = u64;
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prefill,
    Decode,
    Finished,
    Preempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: SequenceId,
    pub request_id: RequestId,
    /// Lower admits first: arrival order within a priority class (§4.5 FIFO
    /// tie-break).
    pub priority: u64,
    pub token_ids: Vec<u32>,
    pub num_prompt_tokens: usize,
    pub sampling_params: SamplingParams,
    pub stage: Stage,
    pub finish_reason: Option<FinishReason>,

    /// Speculative-only: tokens the draft model has proposed this tick but
    /// the target hasn't yet validated, and the draft distribution each was
    /// sampled from (used by the accept/reject rule, §4.7).
    pub num_validated: usize,
    pub proposed_tokens: Vec<u32>,
    pub proposed_distributions: Vec<Vec<f32>>,
}

impl Sequence {
    pub fn new(
        id: SequenceId,
        request_id: RequestId,
        priority: u64,
        prompt_tokens: Vec<u32>,
        sampling_params: SamplingParams,
    ) -> Self {
        let num_prompt_tokens = prompt_tokens.len();
        Self {
            id,
            request_id,
            priority,
            token_ids: prompt_tokens,
            num_prompt_tokens,
            sampling_params,
            stage: Stage::Prefill,
            finish_reason: None,
            num_validated: 0,
            proposed_tokens: Vec::new(),
            proposed_distributions: Vec::new(),
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Finished
    }

    /// `ceil(len(token_ids) / block_size)`, the lower half of §3's
    /// block-table bound invariant.
    pub fn blocks_needed(&self, block_size: usize) -> usize {
        (self.token_ids.len() + block_size - 1) / block_size.max(1)
    }

    pub fn append_token(&mut self, token: u32) {
        self.token_ids.push(token);
        if self.stage == Stage::Prefill {
            self.stage = Stage::Decode;
        }
    }

    pub fn maybe_finish(&mut self) {
        if self.token_ids.len() - self.num_prompt_tokens >= self.sampling_params.max_tokens {
            self.stage = Stage::Finished;
            self.finish_reason = Some(FinishReason::Length);
            return;
        }
        if let Some(&last) = self.token_ids.last() {
            if self.sampling_params.stop_token_ids.contains(&last) {
                self.stage = Stage::Finished;
                self.finish_reason = Some(FinishReason::Stop);
            }
        }
    }
}

/// User-facing unit: one or more sibling `Sequence`s sharing a prompt block
/// prefix via copy-on-write (n>1 sampling).
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub sequence_ids: Vec<SequenceId>,
    pub arrival_order: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_tokens: usize) -> SamplingParams {
        SamplingParams { max_tokens, ..Default::default() }
    }

    #[test]
    fn blocks_needed_rounds_up() {
        let seq = Sequence::new(0, 0, 0, vec![1, 2, 3], params(8));
        assert_eq!(seq.blocks_needed(16), 1);
        let seq = Sequence::new(0, 0, 0, vec![0; 17], params(8));
        assert_eq!(seq.blocks_needed(16), 2);
    }

    #[test]
    fn maybe_finish_on_max_tokens() {
        let mut seq = Sequence::new(0, 0, 0, vec![1, 2], params(1));
        seq.append_token(9);
        seq.maybe_finish();
        assert_eq!(seq.stage, Stage::Finished);
        assert_eq!(seq.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn maybe_finish_on_stop_token() {
        let mut seq = Sequence::new(
            0,
            0,
            0,
            vec![1],
            SamplingParams { stop_token_ids: vec![99], max_tokens: 100, ..Default::default() },
        );
        seq.append_token(99);
        seq.maybe_finish();
        assert_eq!(seq.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn append_token_transitions_prefill_to_decode() {
        let mut seq = Sequence::new(0, 0, 0, vec![1, 2], params(10));
        assert_eq!(seq.stage, Stage::Prefill);
        seq.append_token(3);
        assert_eq!(seq.stage, Stage::Decode);
    }
}
