//! Orchestrates N `Worker`s backing one model replica (§4.4): construction,
//! the weight-load init protocol, device-memory profiling to size the KV
//! cache, and batch dispatch with tensor-parallel fan-out.

use std::thread;

use runner_backend::{
    DType, InputParameters, ModelArgs, OutputParameters, ParallelArgs, QuantArgs, SamplingParams,
    StateDictShard,
};
use runner_common::config::EngineConfig;
use runner_common::{Result, RunnerError};

use crate::worker::Worker;

/// One model replica, sharded across `workers.len()` devices
/// (`world_size`). All devices are assumed homogeneous (§4.4: "all the same
/// type") — enforced here as a `ConfigError` rather than the original
/// engine's process-aborting `CHECK_EQ`.
pub struct Engine {
    workers: Vec<Worker>,
    model_args: ModelArgs,
    dtype: DType,
}

impl Engine {
    /// Step 1-2 of the init protocol: resolves dtype, fans `init_model`
    /// (folded into `Worker::spawn`'s construction handshake) out across
    /// `world_size` ranks, and fails fast if any rank's construction
    /// errored.
    pub fn init(
        architecture: &str,
        mut model_args: ModelArgs,
        quant_args: QuantArgs,
        world_size: usize,
        tokenizer_vocab_size: Option<usize>,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(RunnerError::Config("world_size must be > 0".into()));
        }
        // CPU-only in this workspace (real device dispatch is a non-goal);
        // dtype always resolves to F32 here, matching `parse_dtype`'s CPU
        // branch in the original engine.
        let dtype = DType::resolve(&model_args.dtype, true)?;
        reconcile_vocab_size(&mut model_args, tokenizer_vocab_size);

        let mut workers = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let worker = Worker::spawn(
                rank,
                architecture.to_string(),
                model_args.clone(),
                quant_args.clone(),
                ParallelArgs { rank, world_size },
                dtype,
            )?;
            workers.push(worker);
        }
        Ok(Self { workers, model_args, dtype })
    }

    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    pub fn model_args(&self) -> &ModelArgs {
        &self.model_args
    }

    /// Step 3: streams one shard to every worker in parallel; each worker
    /// extracts its own rank-specific slice (a concern of the concrete
    /// architecture, not this loader).
    pub fn load_state_dict(&self, shard: &StateDictShard) -> Result<()> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|w| scope.spawn(move || w.load_state_dict(shard.clone())))
                .collect();
            for h in handles {
                h.join().map_err(|_| RunnerError::Device { rank: 0, message: "worker panicked".into() })??;
            }
            Ok(())
        })
    }

    /// Step 4: fails hard if any worker is missing a registered parameter.
    pub fn verify_loaded_weights(&self) -> Result<()> {
        for w in &self.workers {
            w.verify_loaded_weights()?;
        }
        Ok(())
    }

    /// Step 5 (§4.4's memory-profiling algorithm): runs a warm-up forward
    /// on every worker, takes the weakest device's cap, and derives
    /// `n_blocks` from it. The "2*" accounts for K and V; `n_local_kv_heads`
    /// reflects the tensor-parallel split.
    pub fn profile_memory_for_kv_cache(&self, config: &EngineConfig) -> Result<usize> {
        let world_size = self.workers.len();
        let n_kv_heads = self.model_args.n_kv_heads();
        let n_local_kv_heads = ParallelArgs { rank: 0, world_size }.n_local_kv_heads(n_kv_heads);
        let head_dim = self.model_args.head_dim();
        let shape_per_block_bytes = 2
            * config.block_size
            * n_local_kv_heads
            * head_dim
            * self.model_args.n_layers
            * self.dtype.size_bytes();

        let mut smallest_cap = i64::MAX;
        for w in &self.workers {
            let (available, total) =
                w.profile_device_memory(config.max_num_tokens_per_batch, config.max_num_seqs_per_batch)?;
            let buffer = (total as f64 * (1.0 - config.max_memory_utilization)) as i64;
            let mut cap = available - buffer;
            if config.max_cache_size_bytes > 0 {
                cap = cap.min(config.max_cache_size_bytes);
            }
            tracing::info!(
                rank = w.rank(),
                available = %runner_common::fmt::readable_size(available),
                total = %runner_common::fmt::readable_size(total),
                cap = %runner_common::fmt::readable_size(cap),
                "profiled device memory"
            );
            smallest_cap = smallest_cap.min(cap);
        }
        let smallest_cap = smallest_cap.max(0);
        Ok(smallest_cap as usize / shape_per_block_bytes.max(1))
    }

    /// Step 6: allocates the K/V tensors on every worker for the profiled
    /// block count.
    pub fn init_kv_cache(&self, n_blocks: usize) -> Result<()> {
        let world_size = self.workers.len();
        let n_kv_heads = self.model_args.n_kv_heads();
        let n_local_kv_heads = ParallelArgs { rank: 0, world_size }.n_local_kv_heads(n_kv_heads);
        let head_dim = self.model_args.head_dim();
        let slot_width = n_local_kv_heads * head_dim;
        for w in &self.workers {
            w.init_kv_cache(self.model_args.n_layers, n_blocks, slot_width)?;
        }
        Ok(())
    }

    /// Forward + sample over `input`. Single worker dispatches
    /// synchronously; multiple workers fan out and wait-all. Rank 0's
    /// output is authoritative — under tensor parallelism every rank would
    /// observe identical post-all-reduce logits.
    pub fn execute_model(&self, input: InputParameters, sampling: Vec<SamplingParams>) -> Result<OutputParameters> {
        if self.workers.len() == 1 {
            return self.workers[0].execute_model(input, sampling);
        }
        self.fan_out(input, sampling, |w, i, s| w.execute_model(i, s))
    }

    /// Forward-only over `input`, returning per-position candidate
    /// distributions (used both by plain batch validation and by the
    /// speculative draft/verify passes).
    pub fn validate(&self, input: InputParameters, sampling: Vec<SamplingParams>) -> Result<OutputParameters> {
        if self.workers.len() == 1 {
            return self.workers[0].validate(input, sampling);
        }
        self.fan_out(input, sampling, |w, i, s| w.validate(i, s))
    }

    /// Copy-on-write's block-copy op (§4.2), applied on every worker: all
    /// ranks hold parallel shards of the same logical cache, so a COW split
    /// must duplicate `src`'s slots into `dst` symmetrically everywhere.
    pub fn copy_block(&self, src_block: usize, dst_block: usize) -> Result<()> {
        if self.workers.len() == 1 {
            return self.workers[0].copy_block(src_block, dst_block);
        }
        thread::scope(|scope| {
            let handles: Vec<_> =
                self.workers.iter().map(|w| scope.spawn(move || w.copy_block(src_block, dst_block))).collect();
            for h in handles {
                h.join().map_err(|_| RunnerError::Device { rank: 0, message: "worker panicked".into() })??;
            }
            Ok(())
        })
    }

    fn fan_out<F>(&self, input: InputParameters, sampling: Vec<SamplingParams>, call: F) -> Result<OutputParameters>
    where
        F: Fn(&Worker, InputParameters, Vec<SamplingParams>) -> Result<OutputParameters> + Sync,
    {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|w| {
                    let input = input.clone();
                    let sampling = sampling.clone();
                    scope.spawn(move || call(w, input, sampling))
                })
                .collect();
            let mut results = Vec::with_capacity(handles.len());
            for h in handles {
                results.push(h.join().map_err(|_| RunnerError::Device { rank: 0, message: "worker panicked".into() })??);
            }
            // All ranks observe the same op in the same order (collective
            // invariant, §5); rank 0's result is authoritative.
            Ok(results.into_iter().next().expect("at least one worker"))
        })
    }
}

/// Adopts the tokenizer's vocab size when the model's is unset, warns on
/// mismatch otherwise (ported from the original engine's `init_model`).
fn reconcile_vocab_size(model_args: &mut ModelArgs, tokenizer_vocab_size: Option<usize>) {
    let Some(tokenizer_vocab) = tokenizer_vocab_size else { return };
    if model_args.vocab_size <= 0 {
        tracing::warn!(tokenizer_vocab, "model vocab size is not set, adopting tokenizer's");
        model_args.vocab_size = tokenizer_vocab as i64;
    } else if model_args.vocab_size as usize != tokenizer_vocab {
        tracing::warn!(
            tokenizer_vocab,
            model_vocab = model_args.vocab_size,
            "vocab size mismatch between tokenizer and model"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::mock::MockModel;

    fn ensure_mock_registered() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| MockModel::register(runner_backend::global_registry()));
    }

    fn small_args() -> ModelArgs {
        ModelArgs { vocab_size: 32, hidden_size: 8, n_layers: 2, n_heads: 2, n_kv_heads: None, dtype: "auto".into() }
    }

    #[test]
    fn init_reconciles_unset_vocab_from_tokenizer() {
        ensure_mock_registered();
        let engine = Engine::init("mock", ModelArgs { vocab_size: -1, ..small_args() }, QuantArgs::default(), 1, Some(99))
            .unwrap();
        assert_eq!(engine.model_args().vocab_size, 99);
    }

    #[test]
    fn init_fails_fast_on_unknown_architecture() {
        let err = Engine::init("does-not-exist", small_args(), QuantArgs::default(), 1, None);
        assert!(err.is_err());
    }

    #[test]
    fn memory_profile_derives_block_count_from_weakest_worker() {
        ensure_mock_registered();
        let engine = Engine::init("mock", small_args(), QuantArgs::default(), 1, None).unwrap();
        let mut config = EngineConfig::default();
        config.block_size = 16;
        config.max_cache_size_bytes = 1024 * 1024;
        let n_blocks = engine.profile_memory_for_kv_cache(&config).unwrap();
        assert!(n_blocks > 0);
    }

    #[test]
    fn execute_model_round_trips_through_a_single_worker() {
        ensure_mock_registered();
        let engine = Engine::init("mock", small_args(), QuantArgs::default(), 1, None).unwrap();
        engine.init_kv_cache(4).unwrap();
        let input = InputParameters {
            flatten_token_ids: vec![1, 2, 3],
            flatten_positions: vec![0, 1, 2],
            cu_seqlens: vec![0, 3],
            block_tables: vec![vec![0]],
            slot_mapping: vec![0, 1, 2],
            last_token_idxes: vec![2],
            all_prefill_sequences: true,
        };
        let out = engine.execute_model(input, vec![SamplingParams::default()]).unwrap();
        assert_eq!(out.token_ids.len(), 1);
    }
}
