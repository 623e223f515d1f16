//! Outbound email
//!
//! Task handlers only see the [`EmailSender`] trait. [`HttpEmailSender`]
//! posts messages to an HTTP mail relay.

pub mod http;

use async_trait::async_trait;

use crate::error::Result;

pub use http::HttpEmailSender;

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// `attach_files` are local paths read at send time
    async fn send_email(
        &self,
        subject: &str,
        content: &str,
        to: &[String],
        cc: &[String],
        bcc: &[String],
        attach_files: &[String],
    ) -> Result<()>;
}
