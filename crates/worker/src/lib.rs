//! Trigger ingestion and job processing for Herald.
//!
//! The factory turns validated triggers into per-recipient job chains;
//! the processor drains the queue and walks each job through its state
//! machine; the pool runs N processors over one shared queue.

pub mod config;
pub mod factory;
pub mod pool;
pub mod processor;
pub mod queue;

pub use config::WorkerConfig;
pub use factory::{validate_trigger, JobFactory, TriggerResult};
pub use pool::WorkerPool;
pub use processor::JobProcessor;
pub use queue::{InMemoryQueue, JobQueue};
