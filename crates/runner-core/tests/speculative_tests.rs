//! End-to-end speculative decoding through the public API, plus a
//! statistical check of the accept/reject rule exposed for scheduler use.

use rand::SeedableRng;
use rand::rngs::StdRng;
use runner_backend::mock::MockModel;
use runner_backend::{ModelArgs, QuantArgs, SamplingParams};
use runner_core::continuous::NullResponseHandler;
use runner_core::sampler::accept_proposed_token;
use runner_core::{BlockManager, Engine, SchedulerPolicy, SpeculativeScheduler};
use std::sync::{Arc, Once};

fn ensure_mock_registered() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| MockModel::register(runner_backend::global_registry()));
}

#[test]
fn two_engine_pipeline_runs_a_request_to_completion() {
    ensure_mock_registered();
    let args = ModelArgs { vocab_size: 64, hidden_size: 8, n_layers: 1, n_heads: 1, n_kv_heads: None, dtype: "auto".into() };
    let target = Engine::init("mock", args.clone(), QuantArgs::default(), 1, None).unwrap();
    target.init_kv_cache(8).unwrap();
    let draft = Engine::init("mock", args, QuantArgs::default(), 1, None).unwrap();
    draft.init_kv_cache(8).unwrap();

    let mut scheduler = SpeculativeScheduler::new(
        target,
        draft,
        BlockManager::new(16, 8),
        BlockManager::new(16, 8),
        SchedulerPolicy::new(1024, 32),
        2,
        Arc::new(NullResponseHandler),
    );

    let params = SamplingParams { max_tokens: 6, ..Default::default() };
    scheduler.submit(vec![1, 2, 3], params, 0);

    let mut finished = false;
    for _ in 0..20 {
        let report = scheduler.tick().unwrap();
        if !report.finished.is_empty() {
            finished = true;
            break;
        }
    }
    assert!(finished, "the request should eventually finish on its max_tokens budget");
    assert_eq!(scheduler.running_len(), 0);
}

#[test]
fn accept_rate_tracks_the_importance_ratio_across_many_draws() {
    // With q uniform over 4 tokens and p concentrated 4x on one of them,
    // that token's long-run accept rate should approach min(1, p/q) = 1.0
    // while an under-favored token's should approach its own ratio.
    let p = vec![0.7, 0.1, 0.1, 0.1];
    let q = vec![0.25, 0.25, 0.25, 0.25];
    let mut rng = StdRng::seed_from_u64(7);

    let mut accepted = 0;
    let trials = 5000;
    for _ in 0..trials {
        if accept_proposed_token(&mut rng, &p, &q, 0) {
            accepted += 1;
        }
    }
    let rate = accepted as f32 / trials as f32;
    assert!((rate - 1.0).abs() < 0.05, "p/q = 2.8 caps at 1.0, got {rate}");

    let mut accepted = 0;
    for _ in 0..trials {
        if accept_proposed_token(&mut rng, &p, &q, 1) {
            accepted += 1;
        }
    }
    let rate = accepted as f32 / trials as f32;
    assert!((rate - 0.4).abs() < 0.05, "p/q = 0.4 should be the accept rate, got {rate}");
}
