//! Job queue engine: models, routing, storage, workers, scheduling.

pub mod engine;
pub mod job;
pub mod payload;
pub mod processors;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use engine::{EnqueueOptions, QueueEngine};
pub use job::{Job, JobClass, JobPriority, JobState, QueueName};
pub use payload::{AlertSeverity, JobPayload};
pub use registry::{JobProcessor, JobRegistry, ProcessContext};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{EnqueueRequest, EnqueueResult, JobStore, MemoryJobStore, PostgresJobStore};
pub use worker::WorkerPool;
