//! Task model and state machine
//!
//! State IDs are stored as SMALLINT in the `tasks` table.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{BankError, Result};

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

pub const DEFAULT_MAX_RETRY: u32 = 25;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Task lifecycle
///
/// Pending/Scheduled/Retry are ready once `process_at` has passed.
/// Terminal: ARCHIVED (4), COMPLETED (5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TaskState {
    Pending = 0,
    /// Waiting for a future `process_at`
    Scheduled = 1,
    /// Leased by a worker
    Active = 2,
    /// Failed, waiting for its backoff to elapse
    Retry = 3,
    /// Dead-lettered after exhausting its retry budget
    Archived = 4,
    Completed = 5,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Archived | TaskState::Completed)
    }

    /// Whether a worker may pick the task up once `process_at` has passed
    #[inline]
    pub fn is_ready_state(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Scheduled | TaskState::Retry
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::Scheduled),
            2 => Some(TaskState::Active),
            3 => Some(TaskState::Retry),
            4 => Some(TaskState::Archived),
            5 => Some(TaskState::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Active => "ACTIVE",
            TaskState::Retry => "RETRY",
            TaskState::Archived => "ARCHIVED",
            TaskState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TaskState {
    type Error = ();

    fn try_from(value: i16) -> std::result::Result<Self, Self::Error> {
        TaskState::from_id(value).ok_or(())
    }
}

/// When a task becomes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Immediate,
    ProcessIn(Duration),
    ProcessAt(DateTime<Utc>),
}

impl Schedule {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Immediate => now,
            Schedule::ProcessIn(delay) => after(now, *delay),
            Schedule::ProcessAt(at) => *at,
        }
    }
}

/// `at + d`, saturating at the latest representable time
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_retry: u32,
    pub schedule: Schedule,
    pub timeout: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            schedule: Schedule::Immediate,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.schedule = Schedule::ProcessIn(delay);
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Schedule::ProcessAt(at);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A task as stored by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub timeout: Duration,
    pub process_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    pub fn new(
        task_type: impl Into<String>,
        payload: Vec<u8>,
        opts: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let process_at = opts.schedule.resolve(now);
        let state = if process_at > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            queue: opts.queue.clone(),
            state,
            max_retry: opts.max_retry,
            retried: 0,
            timeout: opts.timeout,
            process_at,
            lease_expires_at: None,
            last_error: None,
            last_failed_at: None,
            enqueued_at: now,
            completed_at: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_ready_state() && self.process_at <= now
    }

    /// Whether another failure still leaves retries in the budget
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            max_retry: self.max_retry,
            retried: self.retried,
            state: self.state,
            process_at: self.process_at,
        }
    }
}

/// Metadata returned to producers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub task_type: String,
    pub queue: String,
    pub max_retry: u32,
    pub retried: u32,
    pub state: TaskState,
    pub process_at: DateTime<Utc>,
}

/// A payload type bound to its task type tag
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

pub fn encode_payload<P: Serialize>(payload: &P) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode failures are permanent: redelivering the same bytes cannot help
pub fn decode_payload<P: DeserializeOwned>(bytes: &[u8]) -> Result<P> {
    serde_json::from_slice(bytes)
        .map_err(|e| BankError::PermanentHandler(format!("invalid task payload: {e}")))
}
