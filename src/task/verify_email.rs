//! Send-verify-email task

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::handler::{PayloadHandler, TaskContext};
use super::types::{EnqueueOptions, QUEUE_CRITICAL, TaskPayload};
use crate::error::{BankError, Result};
use crate::mail::EmailSender;
use crate::store::{CreateVerifyEmailParams, LedgerStore};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

impl TaskPayload for PayloadSendVerifyEmail {
    const TYPE_NAME: &'static str = TASK_SEND_VERIFY_EMAIL;
}

/// Critical queue, 10 retries, processed 3 seconds after enqueue
pub fn send_verify_email_options() -> EnqueueOptions {
    EnqueueOptions::default()
        .queue(QUEUE_CRITICAL)
        .max_retry(10)
        .process_in(Duration::from_secs(3))
}

pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

pub struct SendVerifyEmailHandler {
    store: Arc<dyn LedgerStore>,
    mailer: Arc<dyn EmailSender>,
    verify_url_base: String,
}

impl SendVerifyEmailHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        mailer: Arc<dyn EmailSender>,
        verify_url_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            verify_url_base: verify_url_base.into(),
        }
    }
}

#[async_trait]
impl PayloadHandler for SendVerifyEmailHandler {
    type Payload = PayloadSendVerifyEmail;

    async fn handle(&self, ctx: &TaskContext, payload: PayloadSendVerifyEmail) -> Result<()> {
        let mut conn = self.store.acquire().await?;

        // The creating transaction may not be visible yet; retry later
        let user = conn.get_user(&payload.username).await.map_err(|e| match e {
            BankError::NotFound(_) => {
                BankError::handler(format!("user {} does not exist yet", payload.username))
            }
            other => other,
        })?;

        if user.is_email_verified {
            info!(task_id = %ctx.task_id, username = %user.username, "email already verified, skipping");
            return Ok(());
        }

        let verify_email = conn
            .create_verify_email(&CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_secret_code(),
            })
            .await?;

        let verify_url = format!(
            "{}?email_id={}&secret_code={}",
            self.verify_url_base, verify_email.id, verify_email.secret_code
        );
        let subject = "Welcome to Simple Bank";
        let content = format!(
            "Hello {},<br/>\
             Thank you for registering with us!<br/>\
             Please <a href=\"{}\">click here</a> to verify your email address.<br/>",
            user.full_name, verify_url
        );

        self.mailer
            .send_email(subject, &content, &[user.email.clone()], &[], &[], &[])
            .await?;

        info!(
            task_id = %ctx.task_id,
            username = %user.username,
            email = %user.email,
            "processed task"
        );
        Ok(())
    }
}
