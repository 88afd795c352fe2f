//! One OS thread per device (§4.3): owns the model replica and its
//! per-layer KV-cache tensors, executes ops submitted through a FIFO task
//! channel so callers never touch device state directly. Exposes sync
//! (blocking) and async (tokio) variants of every op, per §5's concurrency
//! model: the worker thread completes futures on its own thread, never the
//! scheduler's.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use rand::SeedableRng;
use runner_backend::{
    DType, InputParameters, LayerKvCache, Model, ModelArgs, OutputParameters, ParallelArgs,
    QuantArgs, SamplingParams, StateDictShard,
};
use runner_common::{Result, RunnerError};
use tokio::sync::oneshot;

enum Task {
    LoadStateDict(StateDictShard, oneshot::Sender<Result<()>>),
    VerifyLoadedWeights(oneshot::Sender<Result<()>>),
    ProfileDeviceMemory(usize, usize, oneshot::Sender<Result<(i64, i64)>>),
    InitKvCache(usize, usize, usize, oneshot::Sender<Result<()>>),
    ExecuteModel(InputParameters, Vec<SamplingParams>, oneshot::Sender<Result<OutputParameters>>),
    Validate(InputParameters, Vec<SamplingParams>, oneshot::Sender<Result<OutputParameters>>),
    CopyBlock(usize, usize, oneshot::Sender<Result<()>>),
}

/// A device-bound execution context: model + per-layer KV cache, reachable
/// only through `Worker`'s task channel.
pub struct Worker {
    rank: usize,
    tx: std_mpsc::Sender<Task>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread and constructs `architecture` from the
    /// global model registry inside it — model state never crosses threads.
    /// Blocks until construction finishes so `init_model` failures are
    /// fail-fast and reported to the caller (§4.4 init protocol step 2)
    /// rather than surfacing later as an opaque "worker thread gone" error.
    pub fn spawn(
        rank: usize,
        architecture: String,
        model_args: ModelArgs,
        quant_args: QuantArgs,
        parallel_args: ParallelArgs,
        dtype: DType,
    ) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<Task>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let handle = std::thread::Builder::new()
            .name(format!("runner-worker-{rank}"))
            .spawn(move || {
                let model = runner_backend::global_registry().create(
                    &architecture,
                    &model_args,
                    &quant_args,
                    parallel_args,
                    dtype,
                );
                let mut model = match model {
                    Ok(m) => {
                        let _ = ready_tx.send(Ok(()));
                        m
                    }
                    Err(err) => {
                        tracing::error!(rank, %err, "failed to construct model architecture");
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let mut kv_caches: Vec<LayerKvCache> = Vec::new();
                for task in rx {
                    run_task(rank, task, model.as_mut(), &mut kv_caches);
                }
            })
            .expect("failed to spawn worker thread");
        ready_rx
            .recv()
            .map_err(|_| RunnerError::Device { rank, message: "worker thread exited before init".into() })??;
        Ok(Self { rank, tx, handle: Some(handle) })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn load_state_dict(&self, shard: StateDictShard) -> Result<()> {
        self.call_sync(|tx| Task::LoadStateDict(shard, tx))
    }

    pub fn verify_loaded_weights(&self) -> Result<()> {
        self.call_sync(Task::VerifyLoadedWeights)
    }

    pub fn profile_device_memory(&self, max_tokens: usize, max_seqs: usize) -> Result<(i64, i64)> {
        self.call_sync(|tx| Task::ProfileDeviceMemory(max_tokens, max_seqs, tx))
    }

    pub fn init_kv_cache(&self, n_layers: usize, n_blocks: usize, slot_width: usize) -> Result<()> {
        self.call_sync(|tx| Task::InitKvCache(n_layers, n_blocks, slot_width, tx))
    }

    pub fn execute_model(&self, input: InputParameters, sampling: Vec<SamplingParams>) -> Result<OutputParameters> {
        self.call_sync(|tx| Task::ExecuteModel(input, sampling, tx))
    }

    pub fn validate(&self, input: InputParameters, sampling: Vec<SamplingParams>) -> Result<OutputParameters> {
        self.call_sync(|tx| Task::Validate(input, sampling, tx))
    }

    /// Copy-on-write's worker-mediated block-copy op (§4.2): duplicates
    /// every layer's occupied slots from `src_block` into `dst_block`.
    pub fn copy_block(&self, src_block: usize, dst_block: usize) -> Result<()> {
        self.call_sync(|tx| Task::CopyBlock(src_block, dst_block, tx))
    }

    pub async fn execute_model_async(
        &self,
        input: InputParameters,
        sampling: Vec<SamplingParams>,
    ) -> Result<OutputParameters> {
        self.call_async(|tx| Task::ExecuteModel(input, sampling, tx)).await
    }

    pub async fn validate_async(&self, input: InputParameters, sampling: Vec<SamplingParams>) -> Result<OutputParameters> {
        self.call_async(|tx| Task::Validate(input, sampling, tx)).await
    }

    fn call_sync<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Task,
    {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.blocking_recv()
            .map_err(|_| RunnerError::Device { rank: self.rank, message: "worker thread gone".into() })?
    }

    async fn call_async<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Task,
    {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await
            .map_err(|_| RunnerError::Device { rank: self.rank, message: "worker thread gone".into() })?
    }

    fn send(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| RunnerError::Device { rank: self.rank, message: "worker thread gone".into() })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_task(rank: usize, task: Task, model: &mut dyn Model, kv_caches: &mut Vec<LayerKvCache>) {
    tracing::debug!(rank, task = task_name(&task), "dispatching worker op");
    match task {
        Task::LoadStateDict(shard, reply) => {
            let _ = reply.send(model.load_state_dict(&shard));
        }
        Task::VerifyLoadedWeights(reply) => {
            let _ = reply.send(model.verify_loaded_weights());
        }
        Task::ProfileDeviceMemory(_max_tokens, _max_seqs, reply) => {
            // Real device introspection is a non-goal; report a fixed
            // envelope so the memory-profiling arithmetic in `Engine` has
            // something deterministic to size the KV cache against.
            let total = 8i64 * 1024 * 1024 * 1024;
            let available = total - total / 4;
            let _ = reply.send(Ok((available, total)));
        }
        Task::InitKvCache(n_layers, n_blocks, slot_width, reply) => {
            *kv_caches = (0..n_layers).map(|_| LayerKvCache::new(n_blocks, 1, 1, slot_width)).collect();
            tracing::debug!(rank, n_layers, n_blocks, "kv cache initialized");
            let _ = reply.send(Ok(()));
        }
        Task::ExecuteModel(input, sampling, reply) => {
            let result = execute_and_sample(model, kv_caches, &input, &sampling);
            let _ = reply.send(result);
        }
        Task::Validate(input, sampling, reply) => {
            let result = validate(model, kv_caches, &input, &sampling);
            let _ = reply.send(result);
        }
        Task::CopyBlock(src, dst, reply) => {
            for layer in kv_caches.iter_mut() {
                layer.copy_block(src, dst);
            }
            let _ = reply.send(Ok(()));
        }
    }
}

fn task_name(task: &Task) -> &'static str {
    match task {
        Task::LoadStateDict(..) => "load_state_dict",
        Task::VerifyLoadedWeights(..) => "verify_loaded_weights",
        Task::ProfileDeviceMemory(..) => "profile_device_memory",
        Task::InitKvCache(..) => "init_kv_cache",
        Task::ExecuteModel(..) => "execute_model",
        Task::Validate(..) => "validate",
        Task::CopyBlock(..) => "copy_block",
    }
}

/// Forward + sample: used for continuous-batching decode steps where the
/// engine samples on the worker's behalf.
fn execute_and_sample(
    model: &mut dyn Model,
    kv_caches: &mut [LayerKvCache],
    input: &InputParameters,
    sampling: &[SamplingParams],
) -> Result<OutputParameters> {
    let logits = model.forward(&input.flatten_token_ids, &input.flatten_positions, kv_caches, input)?;
    let vocab_size = model.vocab_size();
    let mut token_ids = Vec::with_capacity(input.last_token_idxes.len());
    let mut logprobs = Vec::with_capacity(input.last_token_idxes.len());
    for (seq_idx, &idx) in input.last_token_idxes.iter().enumerate() {
        let row = &logits[idx * vocab_size..(idx + 1) * vocab_size];
        let params = sampling.get(seq_idx).cloned().unwrap_or_default();
        let mut rng = match params.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let dist = crate::sampler::softmax_top_k_top_p(row, params.top_k, params.top_p, params.temperature);
        let token = crate::sampler::sample_top_k_top_p(&mut rng, row, params.top_k, params.top_p, params.temperature);
        token_ids.push(token as u32);
        logprobs.push(dist[token].max(1e-9).ln());
    }
    Ok(OutputParameters { token_ids, logprobs: Some(logprobs), distributions: None })
}

/// Forward without sampling: returns one probability distribution per
/// flattened input token, grouped by `cu_seqlens` (used both for plain
/// batch validation and for the speculative target/draft passes, which need
/// every candidate position's distribution, not just the last one).
fn validate(
    model: &mut dyn Model,
    kv_caches: &mut [LayerKvCache],
    input: &InputParameters,
    sampling: &[SamplingParams],
) -> Result<OutputParameters> {
    let logits = model.forward(&input.flatten_token_ids, &input.flatten_positions, kv_caches, input)?;
    let vocab_size = model.vocab_size();
    let mut distributions = Vec::with_capacity(input.num_tokens());
    for seq_idx in 0..input.num_seqs() {
        let start = input.cu_seqlens[seq_idx] as usize;
        let end = input.cu_seqlens[seq_idx + 1] as usize;
        let params = sampling.get(seq_idx).cloned().unwrap_or_default();
        for tok_idx in start..end {
            let row = &logits[tok_idx * vocab_size..(tok_idx + 1) * vocab_size];
            distributions.push(crate::sampler::softmax_top_k_top_p(row, params.top_k, params.top_p, params.temperature));
        }
    }
    Ok(OutputParameters { token_ids: Vec::new(), logprobs: None, distributions: Some(distributions) })
}
