//! Wire DTOs for the control RPC responses that don't map 1:1 onto an
//! internal type (the internal types carry more, or less, than the wire
//! contract wants).

use chrono::TimeZone;
use serde::Serialize;

use crate::retry::RetryItem;

#[derive(Debug, Serialize)]
pub struct RetryQueueEntry {
    #[serde(rename = "asunto")]
    pub subject: String,
    #[serde(rename = "destinatario")]
    pub recipient: String,
    #[serde(rename = "intentos")]
    pub attempts: u32,
    #[serde(rename = "proximo_intento")]
    pub next_attempt: String,
    #[serde(rename = "timestamp_creacion")]
    pub created_at: String,
}

impl From<&RetryItem> for RetryQueueEntry {
    fn from(item: &RetryItem) -> Self {
        let next_attempt = chrono::Local
            .timestamp_opt(item.next_attempt_epoch as i64, 0)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        Self {
            subject: item.message.subject.clone(),
            recipient: item.recipient.clone(),
            attempts: item.attempts,
            next_attempt,
            created_at: item.created_at.clone(),
        }
    }
}
