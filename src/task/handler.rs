//! Task handler seam
//!
//! The processor dispatches raw payload bytes to a [`TaskHandler`] looked up
//! by type tag. Most handlers implement [`PayloadHandler`] instead and let
//! [`Typed`] decode the payload for them.

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::types::{TaskPayload, decode_payload};
use crate::error::Result;

/// Per-invocation context
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub queue: String,
    /// Retries already consumed before this attempt
    pub retried: u32,
    pub max_retry: u32,
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        task_type: impl Into<String>,
        queue: impl Into<String>,
        retried: u32,
        max_retry: u32,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            queue: queue.into(),
            retried,
            max_retry,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        wait_cancelled(&mut rx).await;
    }
}

pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        // A dropped sender counts as cancellation
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, ctx: &TaskContext, payload: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    type Payload: TaskPayload;

    async fn handle(&self, ctx: &TaskContext, payload: Self::Payload) -> Result<()>;
}

/// Adapts a [`PayloadHandler`] to the raw [`TaskHandler`] interface
pub struct Typed<H> {
    inner: H,
}

impl<H: PayloadHandler> Typed<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: PayloadHandler> TaskHandler for Typed<H> {
    async fn process(&self, ctx: &TaskContext, payload: &[u8]) -> Result<()> {
        let payload: H::Payload = decode_payload(payload)?;
        self.inner.handle(ctx, payload).await
    }
}
