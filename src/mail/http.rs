//! HTTP mail relay client

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::EmailSender;
use crate::config::MailConfig;
use crate::error::{BankError, Result};

#[derive(Debug, Serialize)]
struct Mailbox<'a> {
    name: &'a str,
    address: &'a str,
}

#[derive(Debug, Serialize)]
struct Attachment {
    filename: String,
    content_base64: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: Mailbox<'a>,
    subject: &'a str,
    html: &'a str,
    to: &'a [String],
    cc: &'a [String],
    bcc: &'a [String],
    attachments: Vec<Attachment>,
}

pub struct HttpEmailSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender_name: String,
    sender_address: String,
}

impl HttpEmailSender {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BankError::Handler(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            sender_name: config.sender_name.clone(),
            sender_address: config.sender_address.clone(),
        })
    }
}

async fn load_attachment(path: &str) -> Result<Attachment> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| BankError::Handler(format!("failed to attach file {path}: {e}")))?;
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    Ok(Attachment {
        filename,
        content_base64: STANDARD.encode(bytes),
    })
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send_email(
        &self,
        subject: &str,
        content: &str,
        to: &[String],
        cc: &[String],
        bcc: &[String],
        attach_files: &[String],
    ) -> Result<()> {
        let mut attachments = Vec::with_capacity(attach_files.len());
        for path in attach_files {
            attachments.push(load_attachment(path).await?);
        }

        let request = SendRequest {
            from: Mailbox {
                name: &self.sender_name,
                address: &self.sender_address,
            },
            subject,
            html: content,
            to,
            cc,
            bcc,
            attachments,
        };
        debug!(url = %self.api_url, recipients = to.len(), "sending email");

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| BankError::Handler(format!("mail relay request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BankError::Handler(format!(
                "mail relay returned {status}: {body}"
            )));
        }

        info!(subject, recipients = to.len(), "email sent");
        Ok(())
    }
}
