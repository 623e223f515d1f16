//! Durable Task Pipeline
//!
//! Producers enqueue through the [`TaskDistributor`]; the [`TaskProcessor`]
//! worker pool leases tasks from the [`Broker`] by weighted queue priority
//! and runs them through a handler registered for their type tag.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING / SCHEDULED ──dequeue──▶ ACTIVE ──ok──▶ COMPLETED
//!                                    │
//!                                    ├─fail, budget left──▶ RETRY ──backoff──▶ ACTIVE
//!                                    ├─fail, exhausted────▶ ARCHIVED
//!                                    └─shutdown───────────▶ PENDING
//! ```

pub mod broker;
pub mod distributor;
pub mod handler;
pub mod memory;
pub mod postgres;
pub mod priority;
pub mod processor;
pub mod retry;
pub mod types;
pub mod verify_email;

pub use broker::Broker;
pub use distributor::TaskDistributor;
pub use handler::{PayloadHandler, TaskContext, TaskHandler, Typed};
pub use memory::MemoryBroker;
pub use postgres::PgBroker;
pub use priority::QueuePriority;
pub use processor::{ProcessorConfig, ProcessorHandle, TaskProcessor};
pub use retry::RetryPolicy;
pub use types::{
    DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT, EnqueueOptions, QUEUE_CRITICAL, QUEUE_DEFAULT, Schedule,
    TaskInfo, TaskMessage, TaskPayload, TaskState, decode_payload, encode_payload,
};
pub use verify_email::{
    PayloadSendVerifyEmail, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL,
    send_verify_email_options,
};
