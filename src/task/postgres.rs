//! PostgreSQL broker
//!
//! Tasks live in the `tasks` table. Workers claim rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent pollers never block on or double
//! lease the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::broker::Broker;
use super::types::{TaskInfo, TaskMessage, TaskState};
use crate::error::{BankError, Result};

const TASK_COLUMNS: &str = "id, task_type, payload, queue, state, max_retry, retried, \
     timeout_ms, process_at, lease_expires_at, last_error, last_failed_at, enqueued_at, \
     completed_at";

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task_type: String,
    payload: Vec<u8>,
    queue: String,
    state: i16,
    max_retry: i32,
    retried: i32,
    timeout_ms: i64,
    process_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_failed_at: Option<DateTime<Utc>>,
    enqueued_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskMessage {
    type Error = BankError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let state = TaskState::from_id(row.state)
            .ok_or_else(|| BankError::Storage(format!("unknown task state {}", row.state)))?;
        Ok(TaskMessage {
            id: row.id,
            task_type: row.task_type,
            payload: row.payload,
            queue: row.queue,
            state,
            max_retry: u32::try_from(row.max_retry).unwrap_or(0),
            retried: u32::try_from(row.retried).unwrap_or(0),
            timeout: Duration::from_millis(u64::try_from(row.timeout_ms).unwrap_or(0)),
            process_at: row.process_at,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            last_failed_at: row.last_failed_at,
            enqueued_at: row.enqueued_at,
            completed_at: row.completed_at,
        })
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Connection-level failures mean the broker is unreachable
fn broker_error(e: sqlx::Error) -> BankError {
    match BankError::from(e) {
        BankError::TransientStorage(msg) | BankError::Storage(msg) => {
            BankError::BrokerUnavailable(msg)
        }
        other => other,
    }
}

fn expect_one(rows_affected: u64, what: &str, id: Uuid) -> Result<()> {
    if rows_affected == 0 {
        return Err(BankError::not_found(format!("{what} {id}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, queue, state, max_retry, retried,
                               timeout_ms, process_at, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9)
            "#,
        )
        .bind(msg.id)
        .bind(&msg.task_type)
        .bind(&msg.payload)
        .bind(&msg.queue)
        .bind(msg.state.id())
        .bind(i32::try_from(msg.max_retry).unwrap_or(i32::MAX))
        .bind(millis(msg.timeout))
        .bind(msg.process_at)
        .bind(msg.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        Ok(msg.info())
    }

    async fn dequeue(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Option<TaskMessage>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET state = $3,
                lease_expires_at = $2 + make_interval(secs => (timeout_ms + $4)::float8 / 1000.0)
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = $1 AND state IN ($5, $6, $7) AND process_at <= $2
                ORDER BY process_at, enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(queue)
            .bind(now)
            .bind(TaskState::Active.id())
            .bind(millis(grace))
            .bind(TaskState::Pending.id())
            .bind(TaskState::Scheduled.id())
            .bind(TaskState::Retry.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(broker_error)?;
        row.map(TaskMessage::try_from).transpose()
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = $2, lease_expires_at = NULL, completed_at = $3
            WHERE id = $1 AND state = $4
            "#,
        )
        .bind(id)
        .bind(TaskState::Completed.id())
        .bind(now)
        .bind(TaskState::Active.id())
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        expect_one(result.rows_affected(), "active task", id)
    }

    async fn retry(
        &self,
        id: Uuid,
        process_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $2, retried = retried + 1, process_at = $3, lease_expires_at = NULL,
                last_error = $4, last_failed_at = $5
            WHERE id = $1 AND state = $6
            "#,
        )
        .bind(id)
        .bind(TaskState::Retry.id())
        .bind(process_at)
        .bind(error)
        .bind(now)
        .bind(TaskState::Active.id())
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        expect_one(result.rows_affected(), "active task", id)
    }

    async fn archive(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $2, lease_expires_at = NULL, last_error = $3, last_failed_at = $4
            WHERE id = $1 AND state = $5
            "#,
        )
        .bind(id)
        .bind(TaskState::Archived.id())
        .bind(error)
        .bind(now)
        .bind(TaskState::Active.id())
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        expect_one(result.rows_affected(), "active task", id)
    }

    async fn requeue(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET state = $2, lease_expires_at = NULL WHERE id = $1 AND state = $3",
        )
        .bind(id)
        .bind(TaskState::Pending.id())
        .bind(TaskState::Active.id())
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;
        expect_one(result.rows_affected(), "active task", id)
    }

    async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = $1 AND lease_expires_at < $2"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(TaskState::Active.id())
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(broker_error)?;
        rows.into_iter().map(TaskMessage::try_from).collect()
    }

    async fn get(&self, id: Uuid) -> Result<TaskMessage> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(broker_error)?
            .ok_or_else(|| BankError::not_found(format!("task {id}")))
            .and_then(TaskMessage::try_from)
    }

    async fn list_archived(&self, queue: &str) -> Result<Vec<TaskMessage>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE queue = $1 AND state = $2 \
             ORDER BY last_failed_at"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(queue)
            .bind(TaskState::Archived.id())
            .fetch_all(&self.pool)
            .await
            .map_err(broker_error)?;
        rows.into_iter().map(TaskMessage::try_from).collect()
    }

    async fn requeue_archived(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskInfo> {
        let sql = format!(
            r#"
            UPDATE tasks SET state = $2, retried = 0, process_at = $3
            WHERE id = $1 AND state = $4
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .bind(TaskState::Pending.id())
            .bind(now)
            .bind(TaskState::Archived.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(broker_error)?
            .ok_or_else(|| BankError::not_found(format!("archived task {id}")))?;
        Ok(TaskMessage::try_from(row)?.info())
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE state = $1 AND completed_at < $2")
            .bind(TaskState::Completed.id())
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(result.rows_affected())
    }
}
