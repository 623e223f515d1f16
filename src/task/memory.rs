//! In-memory broker
//!
//! Same transitions as the PostgreSQL broker. Dequeue is atomic under a
//! single mutex, so one task is never leased to two workers at once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::broker::Broker;
use super::types::{TaskInfo, TaskMessage, TaskState, after};
use crate::error::{BankError, Result};

#[derive(Default)]
pub struct MemoryBroker {
    tasks: Mutex<HashMap<Uuid, TaskMessage>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, TaskMessage>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every task, oldest first
    pub fn all(&self) -> Vec<TaskMessage> {
        let mut tasks: Vec<TaskMessage> = self.tasks().values().cloned().collect();
        tasks.sort_by_key(|t| t.enqueued_at);
        tasks
    }

    fn with_active<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TaskMessage) -> T,
    ) -> Result<T> {
        let mut tasks = self.tasks();
        match tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Active => Ok(f(task)),
            _ => Err(BankError::not_found(format!("active task {id}"))),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo> {
        let info = msg.info();
        let mut tasks = self.tasks();
        if tasks.contains_key(&msg.id) {
            return Err(BankError::Conflict(format!("task {} already enqueued", msg.id)));
        }
        tasks.insert(msg.id, msg);
        Ok(info)
    }

    async fn dequeue(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Option<TaskMessage>> {
        let mut tasks = self.tasks();
        let next = tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.is_ready(now))
            .min_by_key(|t| (t.process_at, t.enqueued_at));

        Ok(next.map(|task| {
            task.state = TaskState::Active;
            task.lease_expires_at = Some(after(now, task.timeout.saturating_add(grace)));
            task.clone()
        }))
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.with_active(id, |task| {
            task.state = TaskState::Completed;
            task.lease_expires_at = None;
            task.completed_at = Some(now);
        })
    }

    async fn retry(
        &self,
        id: Uuid,
        process_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_active(id, |task| {
            task.state = TaskState::Retry;
            task.retried += 1;
            task.process_at = process_at;
            task.lease_expires_at = None;
            task.last_error = Some(error.to_string());
            task.last_failed_at = Some(now);
        })
    }

    async fn archive(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_active(id, |task| {
            task.state = TaskState::Archived;
            task.lease_expires_at = None;
            task.last_error = Some(error.to_string());
            task.last_failed_at = Some(now);
        })
    }

    async fn requeue(&self, id: Uuid) -> Result<()> {
        self.with_active(id, |task| {
            task.state = TaskState::Pending;
            task.lease_expires_at = None;
        })
    }

    async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>> {
        Ok(self
            .tasks()
            .values()
            .filter(|t| {
                t.state == TaskState::Active && t.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<TaskMessage> {
        self.tasks()
            .get(&id)
            .cloned()
            .ok_or_else(|| BankError::not_found(format!("task {id}")))
    }

    async fn list_archived(&self, queue: &str) -> Result<Vec<TaskMessage>> {
        let mut archived: Vec<TaskMessage> = self
            .tasks()
            .values()
            .filter(|t| t.queue == queue && t.state == TaskState::Archived)
            .cloned()
            .collect();
        archived.sort_by_key(|t| t.last_failed_at);
        Ok(archived)
    }

    async fn requeue_archived(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskInfo> {
        let mut tasks = self.tasks();
        match tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Archived => {
                task.state = TaskState::Pending;
                task.retried = 0;
                task.process_at = now;
                Ok(task.info())
            }
            _ => Err(BankError::not_found(format!("archived task {id}"))),
        }
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.tasks();
        let len = tasks.len();
        tasks.retain(|_, t| {
            !(t.state == TaskState::Completed && t.completed_at.is_some_and(|at| at < before))
        });
        Ok((len - tasks.len()) as u64)
    }
}
