use serde::{Deserialize, Serialize};

/// Per-sequence sampling configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub stop_token_ids: Vec<u32>,
    pub max_tokens: usize,
    /// Fixes the sampler's RNG for reproducible tests; `None` seeds from
    /// entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            stop_token_ids: Vec::new(),
            max_tokens: 16,
            seed: None,
        }
    }
}

/// Flattened, per-batch description of a forward pass (§6). Built by
/// `runner_core`'s batch flattener; consumed by `Worker`/`Model::forward`.
#[derive(Debug, Clone, Default)]
pub struct InputParameters {
    pub flatten_token_ids: Vec<u32>,
    pub flatten_positions: Vec<u32>,
    /// Cumulative sequence-length offsets, length `n_seqs + 1`.
    pub cu_seqlens: Vec<u32>,
    /// `[n_seqs][max_blocks]`, -1-padded.
    pub block_tables: Vec<Vec<i64>>,
    /// Physical slot `block_id * block_size + offset` per flattened token.
    pub slot_mapping: Vec<i64>,
    /// Index into the flattened output used to gather logits for sampling,
    /// one per sequence.
    pub last_token_idxes: Vec<usize>,
    pub all_prefill_sequences: bool,
}

impl InputParameters {
    pub fn num_tokens(&self) -> usize {
        self.flatten_token_ids.len()
    }

    pub fn num_seqs(&self) -> usize {
        self.cu_seqlens.len().saturating_sub(1)
    }

    /// Splits the flattened token/position arrays back into per-sequence
    /// slices using `cu_seqlens`. Used by the `prepare_inputs` round-trip
    /// property test (§8).
    pub fn seq_slice(&self, seq_idx: usize) -> (&[u32], &[u32]) {
        let start = self.cu_seqlens[seq_idx] as usize;
        let end = self.cu_seqlens[seq_idx + 1] as usize;
        (&self.flatten_token_ids[start..end], &self.flatten_positions[start..end])
    }
}

/// Output of a forward+sample or a validate-only pass.
#[derive(Debug, Clone, Default)]
pub struct OutputParameters {
    /// Sampled token id per sequence (empty for a pure `validate` pass).
    pub token_ids: Vec<u32>,
    /// Log-probability of the sampled token, when requested.
    pub logprobs: Option<Vec<f32>>,
    /// For `validate`: the full probability distribution at each candidate
    /// position, one `Vec<f32>` (length vocab) per (sequence, position).
    /// Indexed in the same order as the input batch's sequences, then by
    /// position within the sequence's proposed window.
    pub distributions: Option<Vec<Vec<f32>>>,
}

impl OutputParameters {
    /// Reorders every field by `seq_idxes`, the original batch order. The
    /// multi-worker `validate` path must apply this before returning: worker
    /// ranks are not guaranteed to preserve input sequence order (open
    /// question in the original engine's `index_select` call), and output
    /// order must match input order regardless of worker count.
    pub fn reorder_by(&mut self, seq_idxes: &[usize]) {
        if seq_idxes.is_empty() {
            return;
        }
        if !self.token_ids.is_empty() {
            self.token_ids = seq_idxes.iter().map(|&i| self.token_ids[i]).collect();
        }
        if let Some(lp) = &self.logprobs {
            self.logprobs = Some(seq_idxes.iter().map(|&i| lp[i]).collect());
        }
        if let Some(dist) = &self.distributions {
            self.distributions = Some(seq_idxes.iter().map(|&i| dist[i].clone()).collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_slice_round_trips_flattened_batch() {
        let params = InputParameters {
            flatten_token_ids: vec![1, 2, 3, 4, 5],
            flatten_positions: vec![0, 1, 0, 1, 2],
            cu_seqlens: vec![0, 2, 5],
            block_tables: vec![],
            slot_mapping: vec![],
            last_token_idxes: vec![1, 4],
            all_prefill_sequences: true,
        };
        assert_eq!(params.num_seqs(), 2);
        assert_eq!(params.seq_slice(0), (&[1u32, 2][..], &[0u32, 1][..]));
        assert_eq!(params.seq_slice(1), (&[3u32, 4, 5][..], &[0u32, 1, 2][..]));
    }

    #[test]
    fn reorder_by_restores_input_batch_order() {
        let mut out = OutputParameters {
            token_ids: vec![20, 10, 30],
            logprobs: Some(vec![-0.2, -0.1, -0.3]),
            distributions: None,
        };
        // worker returned sequences in order [1, 0, 2]; seq_idxes maps
        // output position -> original input position.
        out.reorder_by(&[1, 0, 2]);
        assert_eq!(out.token_ids, vec![10, 20, 30]);
        assert_eq!(out.logprobs.unwrap(), vec![-0.1, -0.2, -0.3]);
    }
}
