//! Decoding, checkpoint lookup and the task queue

pub mod checkpoint;
pub mod decode;
pub mod output;
pub mod queue;
pub mod sampler;
pub mod store;
pub mod worker;

pub mod generation {
    pub use genqueue_common::generation::{DecodingStrategy, GenerationConfig};
}

pub use queue::TaskQueue;
pub use store::{TaskRecord, TaskStatus, TaskStore};
pub use worker::{JobOutcome, Worker};
