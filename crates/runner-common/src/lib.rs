pub type Result<T> = core::result::Result<T, RunnerError>;

/// Error taxonomy shared across the engine. Fatal-at-init variants
/// (`Config`, `ModelLoad`) are distinguished from recoverable ones
/// (`OutOfBlocks`, `Device`, `Protocol`) so the scheduler can decide retry
/// vs. user-visible failure without matching on strings.
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("not implemented")]
    NotImplemented,
    #[error("config error: {0}")]
    Config(String),
    #[error("model load error: {0}")]
    ModelLoad(String),
    #[error("out of kv blocks: needed {needed}, free {free}")]
    OutOfBlocks { needed: usize, free: usize },
    #[error("device error on worker {rank}: {message}")]
    Device { rank: usize, message: String },
    #[error("speculative protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Message(String),
}

impl RunnerError {
    /// Current tick is aborted and the batch re-queued once for these;
    /// everything else is fatal to the sequence/tick immediately.
    /// `Protocol` is speculative-only (draft/target disagreement) and is
    /// recovered the same way a `Device` error is: the affected sequences
    /// lose their tentative state and are re-prefilled (§4.7).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RunnerError::OutOfBlocks { .. } | RunnerError::Device { .. } | RunnerError::Protocol(_))
    }
}

pub mod fmt {
    /// Human-readable byte size for log lines, e.g. `1.50 GB`.
    pub fn readable_size(bytes: i64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        if bytes == 0 {
            return "0 B".to_string();
        }
        let negative = bytes < 0;
        let mut value = bytes.unsigned_abs() as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        format!("{}{:.2} {}", if negative { "-" } else { "" }, value, UNITS[unit])
    }
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    use crate::RunnerError;

    #[derive(Debug, Clone, Deserialize)]
    pub struct RunnerConfig {
        pub model_dir: PathBuf,
        pub context_size: Option<usize>,
        pub gpu_layers: Option<usize>,
        pub scheduler_tick_ms: Option<u64>,
        pub max_batch_tokens: Option<usize>,
    }

    impl Default for RunnerConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                context_size: Some(2048),
                gpu_layers: None,
                scheduler_tick_ms: Some(2),
                max_batch_tokens: Some(1024),
            }
        }
    }

    impl RunnerConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("RUNNER_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<RunnerConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("RUNNER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("RUNNER_CONTEXT_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.context_size = Some(v); }
            if let Some(v) = env::var("RUNNER_GPU_LAYERS").ok().and_then(|v| v.parse().ok()) { cfg.gpu_layers = Some(v); }
            if let Some(v) = env::var("RUNNER_TICK_MS").ok().and_then(|v| v.parse().ok()) { cfg.scheduler_tick_ms = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) { cfg.max_batch_tokens = Some(v); }
            cfg
        }
    }

    /// Full configuration surface for the batched/speculative engine (§6 of
    /// the execution-core spec). Constructed explicitly and passed down —
    /// no process-wide mutable flags.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct EngineConfig {
        /// Slots per KV block; must be a positive multiple of 16.
        pub block_size: usize,
        /// Upper bound on KV cache bytes per device.
        pub max_cache_size_bytes: i64,
        /// Fraction of total device memory the engine may claim, in (0, 1].
        pub max_memory_utilization: f64,
        /// Token count used to build the dummy batch for memory profiling.
        pub max_num_tokens_per_batch: usize,
        /// Sequence count used to build the dummy batch for memory profiling.
        pub max_num_seqs_per_batch: usize,
        /// Toggles the high-performance attention kernel path (no-op here;
        /// kernels are a non-goal, retained so callers can thread the flag
        /// through to a future backend).
        pub disable_custom_kernels: bool,
        /// Per-tick wall-clock budget for batch assembly.
        pub tick_timeout_ms: u64,
        /// Number of tokens the draft model proposes per speculative tick.
        pub speculative_k: usize,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                block_size: 16,
                max_cache_size_bytes: 5 * 1024 * 1024 * 1024,
                max_memory_utilization: 0.9,
                max_num_tokens_per_batch: 1024,
                max_num_seqs_per_batch: 32,
                disable_custom_kernels: false,
                tick_timeout_ms: 50,
                speculative_k: 4,
            }
        }
    }

    impl EngineConfig {
        pub fn validate(&self) -> Result<(), RunnerError> {
            if self.block_size == 0 || self.block_size % 16 != 0 {
                return Err(RunnerError::Config(format!(
                    "block_size must be a positive multiple of 16, got {}",
                    self.block_size
                )));
            }
            if !(self.max_memory_utilization > 0.0 && self.max_memory_utilization <= 1.0) {
                return Err(RunnerError::Config(format!(
                    "max_memory_utilization must be in (0, 1], got {}",
                    self.max_memory_utilization
                )));
            }
            if self.max_num_seqs_per_batch == 0 {
                return Err(RunnerError::Config("max_num_seqs_per_batch must be > 0".into()));
            }
            Ok(())
        }

        pub fn load() -> Self {
            if let Ok(path) = env::var("RUNNER_ENGINE_CONFIG") {
                if let Ok(text) = std::fs::read_to_string(path) {
                    if let Ok(cfg) = serde_yaml::from_str::<EngineConfig>(&text) {
                        return cfg;
                    }
                }
            }
            let mut cfg = Self::default();
            if let Some(v) = env::var("RUNNER_BLOCK_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.block_size = v; }
            if let Some(v) = env::var("RUNNER_MAX_CACHE_BYTES").ok().and_then(|v| v.parse().ok()) { cfg.max_cache_size_bytes = v; }
            if let Some(v) = env::var("RUNNER_MAX_MEM_UTIL").ok().and_then(|v| v.parse().ok()) { cfg.max_memory_utilization = v; }
            if let Some(v) = env::var("RUNNER_SPECULATIVE_K").ok().and_then(|v| v.parse().ok()) { cfg.speculative_k = v; }
            cfg
        }
    }
}
