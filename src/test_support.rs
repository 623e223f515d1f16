//! Shared test doubles

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{BankError, Result};
use crate::mail::EmailSender;
use crate::task::{TaskContext, TaskHandler};

/// Clock that only moves when told to
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, delta: Duration) {
        let delta = TimeDelta::from_std(delta).unwrap_or(TimeDelta::MAX);
        *self.lock_clock() += delta;
    }

    pub fn advance_millis(&self, millis: i64) {
        *self.lock_clock() += TimeDelta::milliseconds(millis);
    }

    fn lock_clock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

/// Handler that fails until its `succeed_on`-th call
pub struct FlakyHandler {
    calls: Arc<AtomicU32>,
    succeed_on: Option<u32>,
    delay: Duration,
}

impl FlakyHandler {
    pub fn always_failing() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            succeed_on: None,
            delay: Duration::ZERO,
        }
    }

    pub fn succeeding_on(attempt: u32) -> Self {
        Self {
            succeed_on: Some(attempt),
            ..Self::always_failing()
        }
    }

    /// Sleep this long on every call before returning
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn process(&self, _ctx: &TaskContext, _payload: &[u8]) -> Result<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.succeed_on {
            Some(k) if attempt >= k => Ok(()),
            _ => Err(BankError::handler(format!("attempt {attempt} failed"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub subject: String,
    pub content: String,
    pub to: Vec<String>,
}

/// Email sender that records messages instead of sending them
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentEmail>>,
    fail: bool,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send_email(
        &self,
        subject: &str,
        content: &str,
        to: &[String],
        _cc: &[String],
        _bcc: &[String],
        _attach_files: &[String],
    ) -> Result<()> {
        if self.fail {
            return Err(BankError::handler("mail relay unavailable"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentEmail {
                subject: subject.to_string(),
                content: content.to_string(),
                to: to.to_vec(),
            });
        Ok(())
    }
}
