use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use runner_common::{Result, RunnerError};

use crate::input::InputParameters;
use crate::kv_cache::LayerKvCache;
use crate::types::{DType, ModelArgs, ParallelArgs, QuantArgs};

/// One shard of a sharded checkpoint: parameter name -> flat weight data.
/// Real checkpoint parsing is out of scope; this is the seam a loader would
/// fill in.
pub type StateDictShard = HashMap<String, Vec<f32>>;

/// The forward contract every architecture plugged into a `Worker` must
/// implement (§6). Transformer layer math, real weight formats and kernels
/// are black-box collaborators behind this trait — see `runner-backend-llamacpp`
/// for the one concrete, deterministic implementation this workspace ships.
pub trait Model: Send {
    /// Runs one forward pass. Returns logits flattened as `num_tokens *
    /// vocab_size` (row-major, one row per flattened input token).
    fn forward(
        &mut self,
        tokens: &[u32],
        positions: &[u32],
        kv_caches: &mut [LayerKvCache],
        params: &InputParameters,
    ) -> Result<Vec<f32>>;

    /// Loads one shard of a sharded checkpoint; called repeatedly as shards
    /// stream in. Implementations extract their rank-specific slice of each
    /// parameter.
    fn load_state_dict(&mut self, shard: &StateDictShard) -> Result<()>;

    /// Fails hard if any registered parameter was not written by some
    /// `load_state_dict` call.
    fn verify_loaded_weights(&self) -> Result<()>;

    fn vocab_size(&self) -> usize;
}

type ModelFactory =
    dyn Fn(&ModelArgs, &QuantArgs, ParallelArgs, DType) -> Result<Box<dyn Model>> + Send + Sync;

/// Name-keyed factory for closed-set model architectures (design note §9):
/// a tagged/polymorphic `Model` without needing every architecture compiled
/// into the generic loader.
#[derive(Default)]
pub struct ModelRegistry {
    factories: Mutex<HashMap<String, Box<ModelFactory>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { factories: Mutex::new(HashMap::new()) }
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ModelArgs, &QuantArgs, ParallelArgs, DType) -> Result<Box<dyn Model>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .lock()
            .unwrap()
            .insert(name.into(), Box::new(factory));
    }

    pub fn create(
        &self,
        name: &str,
        args: &ModelArgs,
        quant_args: &QuantArgs,
        parallel_args: ParallelArgs,
        dtype: DType,
    ) -> Result<Box<dyn Model>> {
        let factories = self.factories.lock().unwrap();
        let factory = factories
            .get(name)
            .ok_or_else(|| RunnerError::ModelLoad(format!("unknown model architecture: {name}")))?;
        factory(args, quant_args, parallel_args, dtype)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.lock().unwrap().keys().cloned().collect()
    }
}

/// Process-wide registry singleton. A `Mutex`-guarded `HashMap` behind a
/// `OnceLock`, not a mutable global — registration is additive and the
/// registry itself owns all synchronization.
pub fn global_registry() -> &'static ModelRegistry {
    static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ModelRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    impl Model for Stub {
        fn forward(
            &mut self,
            tokens: &[u32],
            _positions: &[u32],
            _kv_caches: &mut [LayerKvCache],
            _params: &InputParameters,
        ) -> Result<Vec<f32>> {
            Ok(vec![0.0; tokens.len()])
        }
        fn load_state_dict(&mut self, _shard: &StateDictShard) -> Result<()> {
            Ok(())
        }
        fn verify_loaded_weights(&self) -> Result<()> {
            Ok(())
        }
        fn vocab_size(&self) -> usize {
            1
        }
    }

    #[test]
    fn registry_creates_registered_architecture() {
        let registry = ModelRegistry::new();
        registry.register("stub", |_, _, _, _| Ok(Box::new(Stub)));
        let model = registry.create(
            "stub",
            &ModelArgs::default(),
            &QuantArgs::default(),
            ParallelArgs::single(),
            DType::F32,
        );
        assert!(model.is_ok());
    }

    #[test]
    fn registry_rejects_unknown_architecture() {
        let registry = ModelRegistry::new();
        let err = registry.create(
            "nope",
            &ModelArgs::default(),
            &QuantArgs::default(),
            ParallelArgs::single(),
            DType::F32,
        );
        assert!(err.is_err());
    }
}
