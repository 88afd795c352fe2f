//! Paged KV-cache memory management, continuous batching, and speculative
//! decoding on top of `runner-backend`'s `Model` trait.

pub mod batch;
pub mod block_manager;
pub mod block_pool;
pub mod continuous;
pub mod engine;
pub mod policy;
pub mod sampler;
pub mod sequence;
pub mod speculative;
pub mod worker;

pub use block_manager::BlockManager;
pub use block_pool::BlockPool;
pub use continuous::{ContinuousScheduler, ResponseHandler};
pub use engine::Engine;
pub use policy::SchedulerPolicy;
pub use sequence::{FinishReason, Request, RequestId, Sequence, SequenceId, Stage};
pub use speculative::SpeculativeScheduler;
pub use worker::Worker;
