//! Task Processor
//!
//! A fixed pool of workers polls the broker. Each poll draws a queue order
//! from the weighted priority table and leases the first ready task found.
//! Outcomes:
//!
//! - success: COMPLETED
//! - failure with budget left: RETRY, ready again after the backoff delay
//! - failure with no budget left, or a permanent failure: ARCHIVED
//! - interrupted by shutdown: PENDING, no retry consumed
//!
//! A recoverer loop sends tasks whose lease ran out (crashed or stuck
//! worker) down the failure path, so every task is delivered at least once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::handler::{PayloadHandler, TaskContext, TaskHandler, Typed, wait_cancelled};
use super::priority::QueuePriority;
use super::retry::RetryPolicy;
use super::types::{TaskMessage, TaskPayload, after};
use crate::SharedClock;
use crate::config::WorkerConfig;
use crate::error::{BankError, Result};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub concurrency: usize,
    /// Idle wait between polls when no queue had a ready task
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub lease_grace: Duration,
    pub recover_interval: Duration,
    pub priority: QueuePriority,
    pub retry: RetryPolicy,
}

impl From<&WorkerConfig> for ProcessorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            lease_grace: Duration::from_secs(config.lease_grace_secs),
            recover_interval: Duration::from_secs(config.recover_interval_secs),
            priority: config.priority(),
            retry: config.retry.policy(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

enum Outcome {
    Done,
    Failed(BankError),
    Interrupted,
}

pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    clock: SharedClock,
    config: ProcessorConfig,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    shutdown: watch::Sender<bool>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, clock: SharedClock, config: ProcessorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            clock,
            config,
            handlers: HashMap::new(),
            shutdown,
        }
    }

    /// Register a handler for raw payload bytes
    pub fn register_raw(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// Register a typed handler under its payload's type tag
    pub fn register<H: PayloadHandler>(&mut self, handler: H) {
        self.register_raw(
            <H::Payload as TaskPayload>::TYPE_NAME,
            Arc::new(Typed::new(handler)),
        );
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Spawn the workers and the recoverer
    pub fn start(self) -> ProcessorHandle {
        Self::spawn(Arc::new(self))
    }

    /// Like [`start`](Self::start) for a processor that is already shared
    pub fn spawn(processor: Arc<Self>) -> ProcessorHandle {
        let concurrency = processor.config.concurrency.max(1);
        info!(
            concurrency,
            queues = ?processor.config.priority.queue_names().collect::<Vec<_>>(),
            strict = processor.config.priority.is_strict(),
            "starting task processor"
        );

        let workers = (0..concurrency)
            .map(|worker_id| tokio::spawn(processor.clone().worker_loop(worker_id)))
            .collect();
        let recoverer = tokio::spawn(processor.clone().recover_loop());

        ProcessorHandle {
            processor,
            workers,
            recoverer,
        }
    }

    /// Lease and run at most one task. Returns whether a task was found.
    pub async fn process_next(&self) -> Result<bool> {
        if *self.shutdown.borrow() {
            return Ok(false);
        }
        let now = self.clock.utc();
        let order = self.config.priority.order(&mut rand::thread_rng());

        for queue in order {
            if let Some(msg) = self
                .broker
                .dequeue(queue, now, self.config.lease_grace)
                .await?
            {
                self.execute(msg).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Send every task with an expired lease down the failure path
    pub async fn recover_expired(&self) -> Result<usize> {
        let now = self.clock.utc();
        let expired = self.broker.list_lease_expired(now).await?;
        for msg in &expired {
            warn!(
                task_id = %msg.id,
                task_type = %msg.task_type,
                queue = %msg.queue,
                "task lease expired"
            );
            self.fail(msg, &BankError::handler("task lease expired"))
                .await;
        }
        Ok(expired.len())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(worker_id, "task worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(worker_id, error = %e, "task poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = wait_cancelled(&mut shutdown) => break,
            }
        }

        debug!(worker_id, "task worker stopped");
    }

    async fn recover_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            interval_secs = self.config.recover_interval.as_secs(),
            "starting task lease recoverer"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.recover_interval) => {}
                _ = wait_cancelled(&mut shutdown) => break,
            }
            match self.recover_expired().await {
                Ok(0) => {}
                Ok(count) => info!(count, "recovered tasks with expired leases"),
                Err(e) => error!(error = %e, "lease recovery scan failed"),
            }
        }
    }

    async fn execute(&self, msg: TaskMessage) {
        let Some(handler) = self.handlers.get(&msg.task_type).cloned() else {
            let err = BankError::PermanentHandler(format!(
                "no handler registered for task type {}",
                msg.task_type
            ));
            self.fail(&msg, &err).await;
            return;
        };

        debug!(
            task_id = %msg.id,
            task_type = %msg.task_type,
            queue = %msg.queue,
            retried = msg.retried,
            "processing task"
        );

        let ctx = TaskContext::new(
            msg.id,
            msg.task_type.clone(),
            msg.queue.clone(),
            msg.retried,
            msg.max_retry,
            self.shutdown.subscribe(),
        );
        let mut cancel = self.shutdown.subscribe();

        let outcome = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel) => Outcome::Interrupted,
            result = tokio::time::timeout(msg.timeout, handler.process(&ctx, &msg.payload)) => {
                match result {
                    Ok(Ok(())) => Outcome::Done,
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::Failed(BankError::handler(format!(
                        "task timed out after {}ms",
                        msg.timeout.as_millis()
                    ))),
                }
            }
        };

        match outcome {
            Outcome::Done => {
                let now = self.clock.utc();
                match self.broker.complete(msg.id, now).await {
                    Ok(()) => info!(
                        task_id = %msg.id,
                        task_type = %msg.task_type,
                        queue = %msg.queue,
                        "task completed"
                    ),
                    Err(e) => warn!(task_id = %msg.id, error = %e, "failed to mark task completed"),
                }
            }
            Outcome::Failed(err) => self.fail(&msg, &err).await,
            Outcome::Interrupted => {
                info!(task_id = %msg.id, task_type = %msg.task_type, "task interrupted by shutdown");
                if let Err(e) = self.broker.requeue(msg.id).await {
                    warn!(task_id = %msg.id, error = %e, "failed to requeue interrupted task");
                }
            }
        }
    }

    async fn fail(&self, msg: &TaskMessage, err: &BankError) {
        let now = self.clock.utc();
        let permanent = matches!(err, BankError::PermanentHandler(_));

        if permanent || !msg.can_retry() {
            error!(
                task_id = %msg.id,
                task_type = %msg.task_type,
                queue = %msg.queue,
                retried = msg.retried,
                max_retry = msg.max_retry,
                payload = %String::from_utf8_lossy(&msg.payload),
                error = %err,
                error_code = err.code(),
                "task archived"
            );
            if let Err(e) = self.broker.archive(msg.id, &err.to_string(), now).await {
                warn!(task_id = %msg.id, error = %e, "failed to archive task");
            }
            return;
        }

        let retried = msg.retried + 1;
        let delay = self.config.retry.delay(retried, &mut rand::thread_rng());
        warn!(
            task_id = %msg.id,
            task_type = %msg.task_type,
            queue = %msg.queue,
            retried,
            max_retry = msg.max_retry,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "task failed, scheduling retry"
        );
        if let Err(e) = self
            .broker
            .retry(msg.id, after(now, delay), &err.to_string(), now)
            .await
        {
            warn!(task_id = %msg.id, error = %e, "failed to schedule task retry");
        }
    }
}

/// Running processor. Dropping it leaves the workers running.
pub struct ProcessorHandle {
    processor: Arc<TaskProcessor>,
    workers: Vec<JoinHandle<()>>,
    recoverer: JoinHandle<()>,
}

impl ProcessorHandle {
    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    /// Broadcast cancellation and wait for workers, aborting stragglers
    /// after the configured timeout
    pub async fn shutdown(self) {
        info!("shutting down task processor");
        self.processor.shutdown.send_replace(true);

        let mut tasks = self.workers;
        tasks.push(self.recoverer);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        let timeout = self.processor.config.shutdown_timeout;
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                timeout_secs = timeout.as_secs(),
                "task workers did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!("task processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EnqueueOptions, MemoryBroker, TaskState};
    use crate::test_support::{FlakyHandler, MutableClock};
    use mockable::Clock;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    struct Harness {
        broker: Arc<MemoryBroker>,
        clock: Arc<MutableClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                broker: Arc::new(MemoryBroker::new()),
                clock: Arc::new(MutableClock::new(Utc::now())),
            }
        }

        fn config() -> ProcessorConfig {
            ProcessorConfig {
                concurrency: 1,
                poll_interval: Duration::from_millis(10),
                shutdown_timeout: Duration::from_secs(2),
                lease_grace: Duration::from_secs(5),
                recover_interval: Duration::from_secs(3600),
                retry: RetryPolicy::new(Duration::from_secs(1), 2, Duration::from_secs(10)),
                ..ProcessorConfig::default()
            }
        }

        fn processor(&self, task_type: &str, handler: Arc<dyn TaskHandler>) -> TaskProcessor {
            let mut processor =
                TaskProcessor::new(self.broker.clone(), self.clock.clone(), Self::config());
            processor.register_raw(task_type, handler);
            processor
        }

        async fn enqueue(&self, task_type: &str, opts: EnqueueOptions) -> Uuid {
            let msg = TaskMessage::new(task_type, b"{}".to_vec(), &opts, self.clock.utc());
            self.broker.enqueue(msg).await.unwrap().id
        }

        /// Run the task to a terminal state, jumping past every backoff
        async fn drain(&self, processor: &TaskProcessor) {
            for _ in 0..100 {
                if !processor.process_next().await.unwrap() {
                    self.clock.advance(Duration::from_secs(60));
                    if !processor.process_next().await.unwrap() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_always_failing_handler_is_archived_after_max_retry() {
        let h = Harness::new();
        let handler = FlakyHandler::always_failing();
        let calls = handler.calls();
        let processor = h.processor("test:flaky", Arc::new(handler));
        let id = h
            .enqueue("test:flaky", EnqueueOptions::default().max_retry(3))
            .await;

        h.drain(&processor).await;

        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.retried, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(task.last_error.as_deref(), Some("task handler failed: attempt 4 failed"));
    }

    #[tokio::test]
    async fn test_handler_succeeding_on_third_attempt_completes() {
        let h = Harness::new();
        let handler = FlakyHandler::succeeding_on(3);
        let calls = handler.calls();
        let processor = h.processor("test:flaky", Arc::new(handler));
        let id = h
            .enqueue("test:flaky", EnqueueOptions::default().max_retry(5))
            .await;

        h.drain(&processor).await;

        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.retried, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let h = Harness::new();
        let processor = h.processor("test:flaky", Arc::new(FlakyHandler::always_failing()));
        let id = h.enqueue("test:flaky", EnqueueOptions::default()).await;

        assert!(processor.process_next().await.unwrap());
        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Retry);
        assert_eq!(task.process_at, h.clock.utc() + chrono::Duration::seconds(1));

        assert!(!processor.process_next().await.unwrap());
        h.clock.advance(Duration::from_secs(1));
        assert!(processor.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_archived_without_retry() {
        let h = Harness::new();
        let processor = h.processor("test:known", Arc::new(FlakyHandler::succeeding_on(1)));
        let id = h.enqueue("test:unknown", EnqueueOptions::default()).await;

        assert!(processor.process_next().await.unwrap());
        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.retried, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let h = Harness::new();
        let handler = FlakyHandler::succeeding_on(1).with_delay(Duration::from_secs(5));
        let processor = h.processor("test:slow", Arc::new(handler));
        let id = h
            .enqueue(
                "test:slow",
                EnqueueOptions::default().timeout(Duration::from_millis(50)),
            )
            .await;

        assert!(processor.process_next().await.unwrap());
        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Retry);
        assert_eq!(task.retried, 1);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_expired_lease_goes_to_retry() {
        let h = Harness::new();
        let processor = h.processor("test:flaky", Arc::new(FlakyHandler::succeeding_on(1)));
        let id = h
            .enqueue(
                "test:flaky",
                EnqueueOptions::default().timeout(Duration::from_secs(10)),
            )
            .await;

        // A worker leased the task and then vanished
        h.broker
            .dequeue("default", h.clock.utc(), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::from_secs(14));
        assert_eq!(processor.recover_expired().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(2));
        assert_eq!(processor.recover_expired().await.unwrap(), 1);
        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Retry);
        assert_eq!(task.retried, 1);
    }

    #[tokio::test]
    async fn test_shutdown_returns_running_task_to_pending() {
        let h = Harness::new();
        let handler = FlakyHandler::succeeding_on(1).with_delay(Duration::from_secs(3600));
        let calls = handler.calls();
        let handle = h.processor("test:slow", Arc::new(handler)).start();
        let id = h.enqueue("test:slow", EnqueueOptions::default()).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task picked up");

        handle.shutdown().await;

        let task = h.broker.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retried, 0);
    }
}
