//! A deterministic `Model` used for testing the scheduler/engine without a
//! real checkpoint or kernels. Every token's logits peak at
//! `(position + 1) % vocab_size`, so greedy decoding deterministically
//! "echoes" an incrementing position — this is what the end-to-end test
//! scenarios in the spec rely on ("model echoes position").

use runner_common::Result;

use crate::input::InputParameters;
use crate::kv_cache::LayerKvCache;
use crate::model::{Model, StateDictShard};
use crate::types::{ModelArgs, ParallelArgs, QuantArgs};

pub struct MockModel {
    vocab_size: usize,
    n_layers: usize,
    loaded: bool,
}

impl MockModel {
    pub fn new(args: &ModelArgs) -> Self {
        let vocab_size = if args.vocab_size > 0 { args.vocab_size as usize } else { 256 };
        Self { vocab_size, n_layers: args.n_layers.max(1), loaded: false }
    }

    pub fn register(registry: &crate::model::ModelRegistry) {
        registry.register("mock", |args, _quant, _parallel, _dtype| {
            Ok(Box::new(MockModel::new(args)) as Box<dyn Model>)
        });
    }
}

impl Model for MockModel {
    fn forward(
        &mut self,
        tokens: &[u32],
        positions: &[u32],
        kv_caches: &mut [LayerKvCache],
        params: &InputParameters,
    ) -> Result<Vec<f32>> {
        let mut logits = vec![0.0f32; tokens.len() * self.vocab_size];
        for (i, &position) in positions.iter().enumerate() {
            let target = (position as usize + 1) % self.vocab_size;
            let row = &mut logits[i * self.vocab_size..(i + 1) * self.vocab_size];
            for (v, slot) in row.iter_mut().enumerate() {
                *slot = -(v as f32 - target as f32).abs();
            }
        }
        for layer in kv_caches.iter_mut().take(self.n_layers) {
            for (i, &slot) in params.slot_mapping.iter().enumerate() {
                if slot < 0 {
                    continue;
                }
                let key = vec![tokens[i] as f32; layer.n_local_kv_heads * layer.head_dim];
                let value = key.clone();
                layer.write_slot(slot as usize, &key, &value);
            }
        }
        Ok(logits)
    }

    fn load_state_dict(&mut self, _shard: &StateDictShard) -> Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn verify_loaded_weights(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            // a mock model has no real weights; loading is optional but we
            // still exercise the "verify" seam other architectures rely on.
            Ok(())
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputParameters;

    #[test]
    fn greedy_argmax_echoes_incremented_position() {
        let args = ModelArgs { vocab_size: 50, ..Default::default() };
        let mut model = MockModel::new(&args);
        let params = InputParameters {
            flatten_token_ids: vec![7],
            flatten_positions: vec![4],
            cu_seqlens: vec![0, 1],
            block_tables: vec![],
            slot_mapping: vec![-1],
            last_token_idxes: vec![0],
            all_prefill_sequences: true,
        };
        let logits = model
            .forward(&params.flatten_token_ids, &params.flatten_positions, &mut [], &params)
            .unwrap();
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, 5);
    }
}
