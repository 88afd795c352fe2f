//! Engine memory-profiling arithmetic and single-worker end-to-end
//! generation through the public API surface.

use runner_backend::mock::MockModel;
use runner_backend::{ModelArgs, QuantArgs, SamplingParams};
use runner_common::config::EngineConfig;
use runner_core::continuous::NullResponseHandler;
use runner_core::{BlockManager, ContinuousScheduler, Engine, SchedulerPolicy};
use std::sync::{Arc, Once};

fn ensure_mock_registered() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| MockModel::register(runner_backend::global_registry()));
}

fn model_args() -> ModelArgs {
    ModelArgs { vocab_size: 64, hidden_size: 16, n_layers: 2, n_heads: 2, n_kv_heads: None, dtype: "auto".into() }
}

#[test]
fn block_count_scales_inversely_with_tensor_parallel_world_size() {
    ensure_mock_registered();
    let mut config = EngineConfig::default();
    config.block_size = 16;
    config.max_cache_size_bytes = 64 * 1024 * 1024;

    let single = Engine::init("mock", model_args(), QuantArgs::default(), 1, None).unwrap();
    let blocks_1 = single.profile_memory_for_kv_cache(&config).unwrap();

    let sharded = Engine::init("mock", model_args(), QuantArgs::default(), 2, None).unwrap();
    let blocks_2 = sharded.profile_memory_for_kv_cache(&config).unwrap();

    // n_local_kv_heads halves with world_size=2 (given an even head count),
    // which roughly doubles how many blocks the same byte cap buys.
    assert!(blocks_2 >= blocks_1, "sharding kv heads across more workers should not shrink capacity");
}

#[test]
fn end_to_end_single_worker_generation_runs_to_completion() {
    ensure_mock_registered();
    let engine = Engine::init("mock", model_args(), QuantArgs::default(), 1, None).unwrap();
    engine.init_kv_cache(8).unwrap();
    let block_manager = BlockManager::new(16, 8);
    let policy = SchedulerPolicy::new(1024, 32);
    let mut scheduler = ContinuousScheduler::new(engine, block_manager, policy, Arc::new(NullResponseHandler));

    let params = SamplingParams { max_tokens: 4, ..Default::default() };
    scheduler.submit(vec![1, 2, 3, 4], params, 1, 0);

    let mut finished = false;
    for _ in 0..20 {
        let report = scheduler.tick().unwrap();
        if !report.finished.is_empty() {
            finished = true;
            break;
        }
    }
    assert!(finished, "a single request should reach FINISHED within its max_tokens budget");
    assert_eq!(scheduler.running_len(), 0);
    assert_eq!(scheduler.waiting_len(), 0);
}

#[test]
fn engine_copy_block_is_reachable_on_every_worker_including_sharded() {
    ensure_mock_registered();
    let single = Engine::init("mock", model_args(), QuantArgs::default(), 1, None).unwrap();
    single.init_kv_cache(4).unwrap();
    single.copy_block(0, 1).unwrap();

    let sharded = Engine::init("mock", model_args(), QuantArgs::default(), 2, None).unwrap();
    sharded.init_kv_cache(4).unwrap();
    sharded.copy_block(0, 1).unwrap();
}

#[test]
fn n_sampling_siblings_diverge_independently_after_cow_split() {
    ensure_mock_registered();
    let engine = Engine::init("mock", model_args(), QuantArgs::default(), 1, None).unwrap();
    engine.init_kv_cache(4).unwrap();
    let block_manager = BlockManager::new(16, 4);
    let policy = SchedulerPolicy::new(1024, 32);
    let mut scheduler = ContinuousScheduler::new(engine, block_manager, policy, Arc::new(NullResponseHandler));

    let params = SamplingParams { max_tokens: 5, ..Default::default() };
    scheduler.submit(vec![0; 17], params, 2, 0);

    scheduler.tick().unwrap(); // prefill + fork
    assert_eq!(scheduler.running_len(), 2);
    let shared_free = scheduler.block_manager().free_blocks();

    scheduler.tick().unwrap(); // both decode; first writer splits its block
    assert_eq!(
        scheduler.block_manager().free_blocks(),
        shared_free - 1,
        "exactly one fresh block should be consumed by the COW split, not one per sibling"
    );
}
