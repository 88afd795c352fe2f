//! Flattens a batch of `Sequence`s plus their `BlockManager` tables into the
//! `InputParameters` the `Model` forward contract consumes (§6).

use runner_backend::InputParameters;

use crate::block_manager::BlockManager;
use crate::sequence::{Sequence, Stage};

/// Builds `InputParameters` for one forward pass over `sequences`. A PREFILL
/// sequence contributes every prompt token it holds; a DECODE sequence
/// contributes exactly its last token (continuous batching, §4.6).
pub fn prepare_inputs(sequences: &[&Sequence], block_manager: &BlockManager) -> InputParameters {
    let mut flatten_token_ids = Vec::new();
    let mut flatten_positions = Vec::new();
    let mut cu_seqlens = vec![0u32];
    let mut block_tables = Vec::with_capacity(sequences.len());
    let mut slot_mapping = Vec::new();
    let mut last_token_idxes = Vec::with_capacity(sequences.len());
    let mut all_prefill = true;

    let block_size = block_manager.block_size();
    for seq in sequences {
        let table = block_manager.block_table(seq.id);
        let start = match seq.stage {
            Stage::Prefill => 0,
            _ => {
                all_prefill = false;
                seq.token_ids.len() - 1
            }
        };
        for position in start..seq.token_ids.len() {
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
        all_prefill_sequences: all_prefill,
    }
}

/// Maps a logical token position to its physical `block_id * block_size +
/// offset` slot, or `-1` if the sequence has no block covering it yet.
pub(crate) fn physical_slot(table: &[usize], block_size: usize, position: usize) -> i64 {
    if block_size == 0 {
        return -1;
    }
    match table.get(position / block_size) {
        Some(&block_id) => (block_id * block_size + position % block_size) as i64,
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::BlockManager;
    use runner_backend::SamplingParams;

    #[test]
    fn prepare_inputs_round_trips_with_seq_slice() {
        let mut mgr = BlockManager::new(16, 4);
        let seq_a = Sequence::new(1, 1, 0, vec![10, 11, 12], SamplingParams::default());
        let seq_b = Sequence::new(2, 2, 1, vec![20, 21], SamplingParams::default());
        mgr.allocate_for(seq_a.id, seq_a.token_ids.len()).unwrap();
        mgr.allocate_for(seq_b.id, seq_b.token_ids.len()).unwrap();

        let refs = vec![&seq_a, &seq_b];
        let params = prepare_inputs(&refs, &mgr);
        assert_eq!(params.num_seqs(), 2);
        assert_eq!(params.seq_slice(0).0, &[10, 11, 12]);
        assert_eq!(params.seq_slice(1).0, &[20, 21]);
        assert!(params.all_prefill_sequences);
    }

    #[test]
    fn decode_stage_contributes_only_last_token() {
        let mut mgr = BlockManager::new(16, 4);
        let mut seq = Sequence::new(1, 1, 0, vec![10, 11, 12], SamplingParams::default());
        mgr.allocate_for(seq.id, seq.token_ids.len()).unwrap();
        seq.stage = Stage::Decode;

        let refs = vec![&seq];
        let params = prepare_inputs(&refs, &mgr);
        assert_eq!(params.num_tokens(), 1);
        assert_eq!(params.flatten_token_ids[0], 12);
        assert!(!params.all_prefill_sequences);
    }

    #[test]
    fn slot_mapping_is_negative_one_without_a_covering_block() {
        let mgr = BlockManager::new(16, 4);
        let seq = Sequence::new(1, 1, 0, vec![1, 2], SamplingParams::default());
        let refs = vec![&seq];
        let params = prepare_inputs(&refs, &mgr);
        assert_eq!(params.slot_mapping, vec![-1, -1]);
    }
}
