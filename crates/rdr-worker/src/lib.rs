//! Classification worker: groups raw message events into per-(user, chat)
//! batches and turns each batch into reply decisions via embedding
//! similarity against the chat's topic set.

pub mod collector;
pub mod manager;
pub mod matcher;
pub mod processor;
pub mod service;

pub use collector::{BatchCollector, BatchSink};
pub use manager::BatchManager;
pub use matcher::TopicMatcher;
pub use processor::BatchProcessor;
pub use service::WorkerService;
