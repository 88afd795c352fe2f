//! The `Model` forward contract, batch input/output shapes, and the
//! name-keyed registry architectures plug into (§6, §9 of the execution-core
//! spec). Concrete architectures live in sibling crates, e.g.
//! `runner-backend-llamacpp`; `mock` below is a deterministic stand-in used
//! by tests and by the CLI's `run` subcommand when no real model is loaded.

pub mod input;
pub mod kv_cache;
pub mod model;
pub mod tokenizer;
pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

pub use input::{InputParameters, OutputParameters, SamplingParams};
pub use kv_cache::LayerKvCache;
pub use model::{global_registry, Model, ModelRegistry, StateDictShard};
pub use tokenizer::{ByteTokenizer, Tokenizer};
pub use types::{DType, ModelArgs, ParallelArgs, QuantArgs};
