//! Task Distributor
//!
//! Serializes a payload and hands it to the broker. Returns as soon as the
//! broker has accepted the task. Only queues the processor polls are
//! accepted, anything else would sit in the broker forever.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::broker::Broker;
use super::priority::QueuePriority;
use super::types::{EnqueueOptions, TaskInfo, TaskMessage, TaskPayload, encode_payload};
use super::verify_email::{PayloadSendVerifyEmail, send_verify_email_options};
use crate::SharedClock;
use crate::error::{BankError, Result};

#[derive(Clone)]
pub struct TaskDistributor {
    broker: Arc<dyn Broker>,
    clock: SharedClock,
    queues: Arc<BTreeSet<String>>,
}

impl TaskDistributor {
    /// `priority` is the table the processor polls
    pub fn new(broker: Arc<dyn Broker>, clock: SharedClock, priority: &QueuePriority) -> Self {
        let queues = priority.queue_names().map(str::to_string).collect();
        Self {
            broker,
            clock,
            queues: Arc::new(queues),
        }
    }

    /// Enqueue `payload` under its type tag
    pub async fn distribute<P: TaskPayload>(
        &self,
        payload: &P,
        opts: EnqueueOptions,
    ) -> Result<TaskInfo> {
        if opts.queue.is_empty() {
            return Err(BankError::validation("queue name must not be empty"));
        }
        if !self.queues.contains(&opts.queue) {
            return Err(BankError::validation(format!(
                "unknown queue {}, expected one of {:?}",
                opts.queue, self.queues
            )));
        }
        let bytes = encode_payload(payload)?;
        let msg = TaskMessage::new(P::TYPE_NAME, bytes, &opts, self.clock.utc());

        let info = self.broker.enqueue(msg).await.map_err(|e| {
            warn!(task_type = P::TYPE_NAME, queue = %opts.queue, error = %e, "enqueue failed");
            e
        })?;

        info!(
            task_id = %info.id,
            task_type = %info.task_type,
            queue = %info.queue,
            max_retry = info.max_retry,
            process_at = %info.process_at,
            "enqueued task"
        );
        Ok(info)
    }

    /// Enqueue a verification email with the standard queue, retry budget and delay
    pub async fn distribute_send_verify_email(&self, username: &str) -> Result<TaskInfo> {
        let payload = PayloadSendVerifyEmail {
            username: username.to_string(),
        };
        self.distribute(&payload, send_verify_email_options()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MemoryBroker, ProcessorConfig, QUEUE_CRITICAL, TASK_SEND_VERIFY_EMAIL, TaskState};
    use chrono::Utc;
    use mockable::DefaultClock;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl TaskPayload for Ping {
        const TYPE_NAME: &'static str = "test:ping";
    }

    fn distributor() -> (Arc<MemoryBroker>, TaskDistributor) {
        let broker = Arc::new(MemoryBroker::new());
        let distributor = TaskDistributor::new(
            broker.clone(),
            Arc::new(DefaultClock),
            &ProcessorConfig::default().priority,
        );
        (broker, distributor)
    }

    #[tokio::test]
    async fn test_distribute_stores_json_payload() {
        let (broker, distributor) = distributor();
        let info = distributor
            .distribute(&Ping { n: 7 }, EnqueueOptions::default())
            .await
            .unwrap();

        let stored = broker.get(info.id).await.unwrap();
        assert_eq!(stored.task_type, "test:ping");
        assert_eq!(stored.payload, br#"{"n":7}"#.to_vec());
        assert_eq!(stored.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_send_verify_email_defaults() {
        let (_broker, distributor) = distributor();
        let before = Utc::now();
        let info = distributor.distribute_send_verify_email("alice").await.unwrap();

        assert_eq!(info.task_type, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(info.queue, QUEUE_CRITICAL);
        assert_eq!(info.max_retry, 10);
        assert_eq!(info.state, TaskState::Scheduled);
        assert!(info.process_at >= before + chrono::Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_empty_queue_rejected() {
        let (_broker, distributor) = distributor();
        let err = distributor
            .distribute(&Ping { n: 1 }, EnqueueOptions::default().queue(""))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unpolled_queue_rejected() {
        let (broker, distributor) = distributor();
        let err = distributor
            .distribute(&Ping { n: 1 }, EnqueueOptions::default().queue("low"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Validation(_)));
        assert!(broker.all().is_empty());
    }

    #[tokio::test]
    async fn test_queue_table_follows_priority() {
        let broker = Arc::new(MemoryBroker::new());
        let priority = QueuePriority::new([("low".to_string(), 1)]);
        let distributor = TaskDistributor::new(broker, Arc::new(DefaultClock), &priority);

        distributor
            .distribute(&Ping { n: 2 }, EnqueueOptions::default().queue("low"))
            .await
            .unwrap();
        let err = distributor
            .distribute(&Ping { n: 3 }, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Validation(_)));
    }
}
