//! Outbound email dispatch collaborator.
//!
//! Flows hand a template name, recipient, and JSON context to an
//! [`EmailSender`] and move on; delivery never blocks a success path. Send
//! failures are logged by the caller and the flow continues.
//!
//! The default sender for local dev is [`LogEmailSender`], which logs and
//! returns `Ok(())`. [`RecordingEmailSender`] captures messages for tests.

use anyhow::Result;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub template: String,
    pub recipient: String,
    pub context: Value,
}

impl EmailMessage {
    #[must_use]
    pub fn new(template: &str, recipient: &str, context: Value) -> Self {
        Self {
            template: template.to_string(),
            recipient: recipient.to_string(),
            context,
        }
    }
}

/// Email delivery abstraction.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error for the caller to log.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            template = %message.template,
            recipient = %message.recipient,
            context = %message.context,
            "email send stub"
        );
        Ok(())
    }
}

/// Test sender that records every message for later inspection.
#[derive(Default)]
pub struct RecordingEmailSender {
    messages: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmailSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EmailSender for RecordingEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}
