use std::sync::Arc;

use axum::Router;
use clap::{Parser, Subcommand, Args};
use runner_api::app;
use runner_backend::mock::MockModel;
use runner_backend::{ModelArgs, QuantArgs, SamplingParams, Tokenizer};
use runner_core::continuous::ResponseHandler;
use runner_core::{BlockManager, ContinuousScheduler, Engine, SchedulerPolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_opentelemetry::OpenTelemetryLayer;

#[derive(Parser, Debug)]
#[command(name = "runner", version, about = "Next Inference CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Serve,
    Run(RunArgs),
    List,
    Stats,
    Pull(PullArgs),
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short = 'n', long, default_value_t = 128)]
    max_tokens: usize,
}

#[derive(Args, Debug)]
struct PullArgs {
    /// Source URL (hf://org/repo/file or https URL)
    source: String,
    /// Optional model name to save under models/<name>.gguf
    #[arg(short, long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Run(args) => run_local(args).await,
        Commands::List => list_models().await,
        Commands::Pull(args) => pull_model(args).await,
        Commands::Stats => stats().await,
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve() {
    let app: Router = app();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await.unwrap();
    tracing::info!("listening on http://0.0.0.0:8080");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();
}

/// Collects the token ids of whichever sequence it sees finish; `run_local`
/// only ever has one sequence in flight, so there is no need to key this by
/// request id the way `runner-api`'s `ChannelResponseHandler` does.
#[derive(Default)]
struct CollectingHandler {
    tokens: std::sync::Mutex<Vec<u32>>,
}

impl ResponseHandler for CollectingHandler {
    fn on_token(&self, _request_id: u64, _seq_id: u64, _token: u32) {}

    fn on_finish(&self, _request_id: u64, _seq_id: u64, token_ids: &[u32]) {
        *self.tokens.lock().unwrap() = token_ids.to_vec();
    }
}

/// Drives a one-off `ContinuousScheduler` with a single request on a
/// single-worker mock engine; for a real architecture, set
/// `RUNNER_ARCHITECTURE` and run `serve` instead so requests share a
/// standing scheduler and KV cache.
async fn run_local(args: RunArgs) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| MockModel::register(runner_backend::global_registry()));

    let tokenizer = runner_backend::tokenizer::ByteTokenizer;
    let model_args = ModelArgs {
        vocab_size: tokenizer.vocab_size() as i64,
        hidden_size: 64,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: None,
        dtype: "auto".to_string(),
    };
    let engine = Engine::init("mock", model_args, QuantArgs::default(), 1, None).expect("engine construction");
    let n_blocks = 64;
    engine.init_kv_cache(n_blocks).expect("init kv cache");
    let handler = Arc::new(CollectingHandler::default());
    let mut scheduler = ContinuousScheduler::new(
        engine,
        BlockManager::new(16, n_blocks),
        SchedulerPolicy::new(1024, 32),
        handler.clone(),
    );

    let prompt_tokens = tokenizer.encode(&args.prompt);
    let sampling = SamplingParams { max_tokens: args.max_tokens, ..Default::default() };
    scheduler.submit(prompt_tokens, sampling, 1, 0);

    loop {
        let report = scheduler.tick().expect("scheduler tick");
        if !report.finished.is_empty() {
            break;
        }
        if scheduler.waiting_len() == 0 && scheduler.running_len() == 0 {
            break;
        }
    }
    let tokens = handler.tokens.lock().unwrap().clone();
    println!("{}", tokenizer.decode(&tokens));
}

async fn list_models() {
    let cfg = runner_common::config::RunnerConfig::load();
    let path = cfg.model_dir;
    match std::fs::read_dir(&path) {
        Ok(read_dir) => {
            println!("models dir: {}", path.display());
            for entry in read_dir.flatten() {
                println!("- {}", entry.path().display());
            }
        }
        Err(_) => println!("no models directory at {}", path.display()),
    }
}

async fn stats() {
    use sysinfo::{System, SystemExt, CpuExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {:.1}%", cpu_avg);
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    println!("GPU: see /metrics for NVML-based GPU stats if NVIDIA is present");
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn pull_model(args: PullArgs) {
    let cfg = runner_common::config::RunnerConfig::load();
    let models_dir = cfg.model_dir;
    let _ = std::fs::create_dir_all(&models_dir);

    let (url, filename) = if let Some(rest) = args.source.strip_prefix("hf://") {
        // naive hf://org/repo/file mapping to https
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            eprintln!("invalid hf:// URL; expected hf://org/repo/file");
            return;
        }
        let org = parts[0];
        let repo = parts[1];
        let file = parts[2..].join("/");
        (format!("https://huggingface.co/{}/{}/resolve/main/{}", org, repo, file), file)
    } else {
        let fname = args.source.split('/').last().unwrap_or("model.gguf").to_string();
        (args.source, fname)
    };

    let name = args.name.unwrap_or_else(|| filename.clone());
    let target_path = models_dir.join(name);
    println!("Downloading to {}", target_path.display());

    match reqwest::get(&url).await {
        Ok(resp) => {
            if !resp.status().is_success() {
                eprintln!("download failed: status {}", resp.status());
                return;
            }
            let bytes = match resp.bytes().await { Ok(b) => b, Err(e) => { eprintln!("download error: {}", e); return; } };
            if let Err(e) = std::fs::write(&target_path, &bytes) {
                eprintln!("write error: {}", e);
                return;
            }
            println!("Saved {} bytes", bytes.len());
        }
        Err(e) => eprintln!("request error: {}", e),
    }
}

