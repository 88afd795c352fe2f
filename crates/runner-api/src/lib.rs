//! HTTP surface over the batched/speculative execution core: submits
//! requests to a dedicated scheduler thread, streams token deltas back over
//! SSE, and exposes `/healthz` + `/metrics`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, TextEncoder};
use runner_backend::mock::MockModel;
use runner_backend::{ModelArgs, QuantArgs, SamplingParams, Tokenizer};
use runner_core::continuous::ResponseHandler;
use runner_core::sequence::RequestId;
use runner_core::{BlockManager, ContinuousScheduler, Engine, SchedulerPolicy, SpeculativeScheduler};
use runner_common::config::EngineConfig;
use runner_common::Result as RunnerResult;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

/// One token (or the terminal summary) as seen by an HTTP caller streaming
/// a single request.
#[derive(Clone)]
pub enum TokenEvent {
    Token(u32),
    Finished(Vec<u32>),
}

/// Routes every `on_token`/`on_finish` callback from the scheduler thread to
/// whichever HTTP handler is awaiting that `RequestId`. The scheduler thread
/// is the sole writer of `channels`; handlers only read/remove their own
/// entry, so lock contention is brief.
#[derive(Default)]
struct ChannelResponseHandler {
    channels: Mutex<HashMap<RequestId, UnboundedSender<TokenEvent>>>,
}

impl ChannelResponseHandler {
    fn register(&self, request_id: RequestId, tx: UnboundedSender<TokenEvent>) {
        self.channels.lock().unwrap().insert(request_id, tx);
    }
}

impl ResponseHandler for ChannelResponseHandler {
    fn on_token(&self, request_id: RequestId, _seq_id: u64, token: u32) {
        if let Some(tx) = self.channels.lock().unwrap().get(&request_id) {
            let _ = tx.send(TokenEvent::Token(token));
        }
    }

    fn on_finish(&self, request_id: RequestId, _seq_id: u64, token_ids: &[u32]) {
        if let Some(tx) = self.channels.lock().unwrap().remove(&request_id) {
            let _ = tx.send(TokenEvent::Finished(token_ids.to_vec()));
        }
    }
}

enum Command {
    Submit { prompt_tokens: Vec<u32>, sampling: SamplingParams, priority: u64, tx: UnboundedSender<TokenEvent> },
}

/// Per-tick observables the driving loop folds into `runner_obs`, collapsed
/// across whichever scheduler is actually running.
#[derive(Default)]
struct TickStats {
    batch_size: usize,
    preempted: usize,
    accepted_tokens: usize,
    rejected_tokens: usize,
}

/// Unifies `ContinuousScheduler` and `SpeculativeScheduler` behind the two
/// operations the driving loop needs; which one backs a given `AppState` is
/// chosen once at `app()` construction from `EngineConfig`/env, never per
/// request.
trait Scheduled {
    fn submit(&mut self, prompt_tokens: Vec<u32>, sampling: SamplingParams, priority: u64) -> RequestId;
    fn tick(&mut self) -> RunnerResult<TickStats>;
    fn queue_depth(&self) -> usize;
    fn block_occupancy(&self) -> (i64, i64);
    /// Whether a second consecutive recoverable tick failure has already
    /// drained this scheduler (§7). `drive()` keeps ticking either way —
    /// the scheduler itself decided there's nothing left to retry.
    fn is_degraded(&self) -> bool;
}

impl Scheduled for ContinuousScheduler {
    fn submit(&mut self, prompt_tokens: Vec<u32>, sampling: SamplingParams, priority: u64) -> RequestId {
        ContinuousScheduler::submit(self, prompt_tokens, sampling, 1, priority)
    }
    fn tick(&mut self) -> RunnerResult<TickStats> {
        let report = ContinuousScheduler::tick(self)?;
        Ok(TickStats {
            batch_size: report.ran.len(),
            preempted: report.preempted.len(),
            ..Default::default()
        })
    }
    fn queue_depth(&self) -> usize {
        self.waiting_len()
    }
    fn block_occupancy(&self) -> (i64, i64) {
        let free = self.block_manager().free_blocks() as i64;
        let total = self.block_manager().total_blocks() as i64;
        (free, total - free)
    }
    fn is_degraded(&self) -> bool {
        ContinuousScheduler::is_degraded(self)
    }
}

impl Scheduled for SpeculativeScheduler {
    fn submit(&mut self, prompt_tokens: Vec<u32>, sampling: SamplingParams, priority: u64) -> RequestId {
        SpeculativeScheduler::submit(self, prompt_tokens, sampling, priority)
    }
    fn tick(&mut self) -> RunnerResult<TickStats> {
        let report = SpeculativeScheduler::tick(self)?;
        Ok(TickStats {
            batch_size: report.committed.len(),
            preempted: report.preempted.len(),
            accepted_tokens: report.accepted_tokens,
            rejected_tokens: report.rejected_tokens,
        })
    }
    fn queue_depth(&self) -> usize {
        self.waiting_len()
    }
    fn block_occupancy(&self) -> (i64, i64) {
        // Target engine's block manager is the admission-relevant one;
        // the draft engine's mirrors it closely enough not to warrant a
        // second gauge pair.
        (0, 0)
    }
    fn is_degraded(&self) -> bool {
        SpeculativeScheduler::is_degraded(self)
    }
}

#[derive(Clone)]
pub struct AppState {
    command_tx: std::sync::mpsc::Sender<Command>,
    tokenizer: Arc<dyn Tokenizer>,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
}

pub fn app() -> Router {
    runner_obs::init();
    runner_obs::spawn_gpu_polling();
    static REGISTER_ONCE: std::sync::Once = std::sync::Once::new();
    REGISTER_ONCE.call_once(|| {
        MockModel::register(runner_backend::global_registry());
        runner_backend_llamacpp::register(runner_backend::global_registry());
    });

    let config = EngineConfig::load();
    config.validate().expect("invalid engine configuration");

    let architecture = std::env::var("RUNNER_ARCHITECTURE").unwrap_or_else(|_| "mock".to_string());
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(runner_backend::tokenizer::ByteTokenizer);
    let model_args = ModelArgs {
        vocab_size: tokenizer.vocab_size() as i64,
        hidden_size: 256,
        n_layers: 4,
        n_heads: 8,
        n_kv_heads: None,
        dtype: "auto".to_string(),
    };

    let (command_tx, command_rx) = std::sync::mpsc::channel::<Command>();
    let handler = Arc::new(ChannelResponseHandler::default());
    let handler_bg = handler.clone();
    let tick_timeout_ms = config.tick_timeout_ms;

    std::thread::Builder::new()
        .name("runner-scheduler".into())
        .spawn(move || {
            let mut scheduler: Box<dyn Scheduled> = build_scheduler(&architecture, model_args, &config, handler_bg.clone());
            drive(&mut *scheduler, command_rx, handler_bg, tick_timeout_ms);
        })
        .expect("failed to spawn scheduler thread");

    let state = AppState {
        command_tx,
        tokenizer,
        requests_total: prometheus::register_int_counter!("runner_requests_total", "Total /generate requests").expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!("runner_tokens_generated_total", "Total output tokens").expect("counter"),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/generate", post(generate))
        .route("/sse/generate", post(generate_sse))
        .with_state(state)
}

fn build_scheduler(
    architecture: &str,
    model_args: ModelArgs,
    config: &EngineConfig,
    handler: Arc<ChannelResponseHandler>,
) -> Box<dyn Scheduled> {
    if config.speculative_k > 0 {
        if let (Ok(target), Ok(draft)) = (
            Engine::init(architecture, model_args.clone(), QuantArgs::default(), 1, None),
            Engine::init(architecture, model_args, QuantArgs::default(), 1, None),
        ) {
            let n_target = target.profile_memory_for_kv_cache(config).unwrap_or(64).max(1);
            let n_draft = draft.profile_memory_for_kv_cache(config).unwrap_or(64).max(1);
            target.init_kv_cache(n_target).expect("init target kv cache");
            draft.init_kv_cache(n_draft).expect("init draft kv cache");
            let scheduler = SpeculativeScheduler::new(
                target,
                draft,
                BlockManager::new(config.block_size, n_target),
                BlockManager::new(config.block_size, n_draft),
                SchedulerPolicy::new(config.max_num_tokens_per_batch, config.max_num_seqs_per_batch),
                config.speculative_k,
                handler,
            );
            return Box::new(scheduler);
        }
        tracing::warn!(architecture, "failed to construct speculative pipeline, falling back to non-speculative");
    }

    let engine = Engine::init(architecture, model_args, QuantArgs::default(), 1, None).expect("engine construction");
    let n_blocks = engine.profile_memory_for_kv_cache(config).unwrap_or(64).max(1);
    engine.init_kv_cache(n_blocks).expect("init kv cache");
    let scheduler = ContinuousScheduler::new(
        engine,
        BlockManager::new(config.block_size, n_blocks),
        SchedulerPolicy::new(config.max_num_tokens_per_batch, config.max_num_seqs_per_batch),
        handler,
    );
    Box::new(scheduler)
}

/// Owns the scheduler on its own thread (§5: one scheduler thread). Drains
/// up to `tick_timeout_ms` worth of incoming submissions, registers their
/// response channel, then runs one tick; repeats forever.
fn drive(
    scheduler: &mut dyn Scheduled,
    command_rx: std::sync::mpsc::Receiver<Command>,
    handler: Arc<ChannelResponseHandler>,
    tick_timeout_ms: u64,
) {
    let tick_timeout = std::time::Duration::from_millis(tick_timeout_ms.max(1));
    loop {
        let deadline = std::time::Instant::now() + tick_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match command_rx.recv_timeout(remaining) {
                Ok(Command::Submit { prompt_tokens, sampling, priority, tx }) => {
                    let request_id = scheduler.submit(prompt_tokens, sampling, priority);
                    handler.register(request_id, tx);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => break,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
        let stats = match scheduler.tick() {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!(%err, "scheduler tick failed");
                TickStats::default()
            }
        };
        let (free, used) = scheduler.block_occupancy();
        runner_obs::record_tick(free, used, scheduler.queue_depth() as i64, stats.batch_size as i64, stats.preempted);
        runner_obs::record_speculative(stats.accepted_tokens, stats.rejected_tokens);
        runner_obs::record_degraded(scheduler.is_degraded());
    }
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    top_p: Option<f32>,
}

fn default_max_tokens() -> usize {
    128
}

#[derive(serde::Serialize)]
struct GenerateResponse {
    text: String,
    token_ids: Vec<u32>,
}

fn sampling_params(req: &GenerateRequest) -> SamplingParams {
    SamplingParams {
        max_tokens: req.max_tokens,
        temperature: req.temperature.unwrap_or(1.0),
        top_k: req.top_k.unwrap_or(0),
        top_p: req.top_p.unwrap_or(1.0),
        ..Default::default()
    }
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerateResponse> {
    state.requests_total.inc();
    let prompt_tokens = state.tokenizer.encode(&req.prompt);
    let (tx, mut rx) = unbounded_channel();
    let sampling = sampling_params(&req);
    let _ = state.command_tx.send(Command::Submit { prompt_tokens, sampling, priority: 0, tx });

    let mut token_ids = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            TokenEvent::Token(_) => {}
            TokenEvent::Finished(tokens) => {
                token_ids = tokens;
                break;
            }
        }
    }
    state.tokens_generated_total.inc_by(token_ids.len() as u64);
    let text = state.tokenizer.decode(&token_ids);
    Json(GenerateResponse { text, token_ids })
}

async fn generate_sse(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Sse<impl axum::response::sse::Stream<Item = RunnerResult<Event>>> {
    state.requests_total.inc();
    let prompt_tokens = state.tokenizer.encode(&req.prompt);
    let (tx, rx) = unbounded_channel();
    let sampling = sampling_params(&req);
    let _ = state.command_tx.send(Command::Submit { prompt_tokens, sampling, priority: 0, tx });

    let tokens_generated_total = state.tokens_generated_total.clone();
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let event = match event {
            TokenEvent::Token(t) => Event::default().data(t.to_string()),
            TokenEvent::Finished(tokens) => {
                tokens_generated_total.inc_by(tokens.len() as u64);
                Event::default().event("done").data(tokens.len().to_string())
            }
        };
        Ok(event)
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_tokens_matches_documented_default() {
        assert_eq!(default_max_tokens(), 128);
    }
}
