//! Composition root
//!
//! Wires the pool, ledger store, task broker, distributor and processor
//! together. Orchestrator calls that need collaborators (the create-user hook
//! needs the distributor) are exposed here so callers never assemble them
//! by hand.

use futures::FutureExt;
use mockable::DefaultClock;
use std::sync::Arc;
use tracing::info;

use crate::SharedClock;
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{BankError, Result};
use crate::mail::{EmailSender, HttpEmailSender};
use crate::store::{CreateUserParams, LedgerStore, PgStore, User};
use crate::task::{
    Broker, PgBroker, ProcessorConfig, ProcessorHandle, SendVerifyEmailHandler, TaskDistributor,
    TaskProcessor,
};
use crate::tx::{
    CreateUserTxParams, CreateUserTxResult, TransferTxParams, TransferTxResult,
    VerifyEmailTxParams, VerifyEmailTxResult, create_user_tx, transfer_tx, verify_email_tx,
};

pub struct App {
    db: Option<Database>,
    store: Arc<dyn LedgerStore>,
    broker: Arc<dyn Broker>,
    distributor: TaskDistributor,
    processor: Arc<TaskProcessor>,
    running: Option<ProcessorHandle>,
}

impl App {
    /// Connect to PostgreSQL, bootstrap the schema and build every component
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database).await?;
        db.migrate().await?;

        let pool = db.pool().clone();
        let mailer = HttpEmailSender::new(&config.mail)?;
        let mut app = Self::assemble(
            Arc::new(PgStore::new(pool.clone())),
            Arc::new(PgBroker::new(pool)),
            Arc::new(mailer),
            Arc::new(DefaultClock),
            ProcessorConfig::from(&config.worker),
            &config.mail.verify_url_base,
        );
        app.db = Some(db);
        Ok(app)
    }

    /// Build from already-constructed backends
    pub fn assemble(
        store: Arc<dyn LedgerStore>,
        broker: Arc<dyn Broker>,
        mailer: Arc<dyn EmailSender>,
        clock: SharedClock,
        worker: ProcessorConfig,
        verify_url_base: &str,
    ) -> Self {
        let distributor = TaskDistributor::new(broker.clone(), clock.clone(), &worker.priority);

        let mut processor = TaskProcessor::new(broker.clone(), clock, worker);
        processor.register(SendVerifyEmailHandler::new(
            store.clone(),
            mailer,
            verify_url_base,
        ));

        Self {
            db: None,
            store,
            broker,
            distributor,
            processor: Arc::new(processor),
            running: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn distributor(&self) -> &TaskDistributor {
        &self.distributor
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    /// Start the worker pool. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.running.is_none() {
            self.running = Some(TaskProcessor::spawn(self.processor.clone()));
        }
    }

    pub async fn transfer(&self, params: TransferTxParams) -> Result<TransferTxResult> {
        transfer_tx(self.store.as_ref(), params).await
    }

    /// Create a user and enqueue the verification email in the same unit of work
    pub async fn create_user(&self, params: CreateUserParams) -> Result<CreateUserTxResult> {
        let distributor = self.distributor.clone();
        let args = CreateUserTxParams {
            params,
            after_create: Box::new(move |user: User| {
                async move {
                    distributor
                        .distribute_send_verify_email(&user.username)
                        .await?;
                    Ok::<(), BankError>(())
                }
                .boxed()
            }),
        };
        create_user_tx(self.store.as_ref(), args).await
    }

    pub async fn verify_email(&self, params: VerifyEmailTxParams) -> Result<VerifyEmailTxResult> {
        verify_email_tx(self.store.as_ref(), params).await
    }

    /// Stop the processor, then close the pool
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.running.take() {
            handle.shutdown().await;
        }
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        info!("simple bank stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::{MemoryBroker, QUEUE_CRITICAL, TASK_SEND_VERIFY_EMAIL, TaskState};
    use crate::test_support::{MutableClock, RecordingEmailSender};
    use chrono::Utc;

    fn memory_app() -> (App, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let app = App::assemble(
            Arc::new(MemoryStore::new()),
            broker.clone(),
            Arc::new(RecordingEmailSender::new()),
            Arc::new(MutableClock::new(Utc::now())),
            ProcessorConfig::default(),
            "http://bank.test/verify",
        );
        (app, broker)
    }

    fn params(username: &str) -> CreateUserParams {
        CreateUserParams {
            username: username.into(),
            hashed_password: "hash".into(),
            full_name: "Test User".into(),
            email: format!("{username}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_create_user_enqueues_verification_task() {
        let (app, broker) = memory_app();

        let result = app.create_user(params("alice")).await.unwrap();
        assert_eq!(result.user.username, "alice");

        let tasks = broker.all();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(tasks[0].queue, QUEUE_CRITICAL);
        assert_eq!(tasks[0].max_retry, 10);
        assert_eq!(tasks[0].state, TaskState::Scheduled);
    }

    #[tokio::test]
    async fn test_rejected_user_enqueues_nothing() {
        let (app, broker) = memory_app();

        let err = app.create_user(params("x")).await.unwrap_err();
        assert!(matches!(err, BankError::Validation(_)));
        assert!(broker.all().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_database() {
        let (mut app, _broker) = memory_app();
        app.start();
        app.start();
        app.shutdown().await;
    }
}
