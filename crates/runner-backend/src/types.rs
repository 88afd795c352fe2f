use serde::{Deserialize, Serialize};

/// Compute dtype for model weights and activations. CPU devices always run
/// in `F32` regardless of what was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F16,
    BF16,
    F32,
}

impl DType {
    /// Size in bytes of one element, used by the KV-cache block-size
    /// arithmetic in the engine's memory profiling.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
        }
    }

    /// Mirrors `parse_dtype` from the original engine: CPU devices always
    /// get `F32`; otherwise `half`/`float16` -> F16, `bfloat16` -> BF16,
    /// `float`/`float32` -> F32, empty or `auto` -> F16.
    pub fn resolve(requested: &str, is_cpu: bool) -> Result<DType, runner_common::RunnerError> {
        if is_cpu {
            return Ok(DType::F32);
        }
        let lower = requested.to_ascii_lowercase();
        match lower.as_str() {
            "half" | "float16" => Ok(DType::F16),
            "bfloat16" => Ok(DType::BF16),
            "float" | "float32" => Ok(DType::F32),
            "" | "auto" => Ok(DType::F16),
            other => Err(runner_common::RunnerError::Config(format!(
                "unsupported dtype: {other}"
            ))),
        }
    }
}

/// Architecture-level description of a model, analogous to the original
/// engine's `ModelArgs`. Quantization formats and rotary embedding configs
/// are out of scope — see `QuantArgs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    pub vocab_size: i64,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: Option<usize>,
    pub dtype: String,
}

impl ModelArgs {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads.max(1)
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            vocab_size: -1,
            hidden_size: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            dtype: "auto".to_string(),
        }
    }
}

/// Quantization config placeholder. Quantization formats are an explicit
/// non-goal; this struct exists so `Model::load_state_dict` call sites have
/// somewhere to thread a (currently inert) config through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantArgs {
    pub quant_method: Option<String>,
}

/// Tensor-parallel placement of one worker within the replica group.
#[derive(Debug, Clone, Copy)]
pub struct ParallelArgs {
    pub rank: usize,
    pub world_size: usize,
}

impl ParallelArgs {
    pub fn single() -> Self {
        Self { rank: 0, world_size: 1 }
    }

    pub fn n_local_kv_heads(&self, n_kv_heads: usize) -> usize {
        (n_kv_heads / self.world_size.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_resolve_cpu_always_f32() {
        assert_eq!(DType::resolve("bfloat16", true).unwrap(), DType::F32);
    }

    #[test]
    fn dtype_resolve_gpu_variants() {
        assert_eq!(DType::resolve("half", false).unwrap(), DType::F16);
        assert_eq!(DType::resolve("bfloat16", false).unwrap(), DType::BF16);
        assert_eq!(DType::resolve("float32", false).unwrap(), DType::F32);
        assert_eq!(DType::resolve("auto", false).unwrap(), DType::F16);
        assert_eq!(DType::resolve("", false).unwrap(), DType::F16);
    }

    #[test]
    fn dtype_resolve_rejects_unknown() {
        assert!(DType::resolve("int8", false).is_err());
    }

    #[test]
    fn parallel_args_splits_kv_heads() {
        let pa = ParallelArgs { rank: 1, world_size: 4 };
        assert_eq!(pa.n_local_kv_heads(8), 2);
    }
}
