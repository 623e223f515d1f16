//! Durable task broker
//!
//! The broker is the only owner of task records between enqueue and
//! completion. Producers and the processor share nothing else.
//!
//! State transitions out of ACTIVE (`complete`, `retry`, `archive`,
//! `requeue`) only apply while the task is still ACTIVE; otherwise they
//! return `NotFound`, which is how a worker learns its lease was lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::types::{TaskInfo, TaskMessage};
use crate::error::Result;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo>;

    /// Claim the oldest ready task of `queue`. The lease runs for the task's
    /// own timeout plus `grace`.
    async fn dequeue(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Option<TaskMessage>>;

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Consume one retry and make the task ready again at `process_at`
    async fn retry(
        &self,
        id: Uuid,
        process_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Dead-letter the task
    async fn archive(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Return an interrupted task to PENDING without consuming a retry
    async fn requeue(&self, id: Uuid) -> Result<()>;

    /// ACTIVE tasks whose lease expired before `now`
    async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>>;

    // === Inspection ===

    async fn get(&self, id: Uuid) -> Result<TaskMessage>;

    async fn list_archived(&self, queue: &str) -> Result<Vec<TaskMessage>>;

    /// Manual replay of a dead-lettered task, with a fresh retry budget
    async fn requeue_archived(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskInfo>;

    /// Delete completed tasks finished before `before`; returns the count
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64>;
}
