//! On-demand runner spawning from queued job requests.
//!
//! The consumer shares the capacity gate with the reconciler, so reactive
//! creates and pass creates are decided under the same lock and the global
//! cap holds across both.

pub mod consumer;
pub mod queue;

pub use consumer::{BackoffPolicy, BatchReport, Disposition, ReactiveConsumer};
pub use queue::{Acker, Delivery, JobQueue, MemoryQueue, NatsQueue, NatsQueueConfig};
