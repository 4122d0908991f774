//! Durable retry queue.
//!
//! A delivery that fails transiently is snapshotted (account credentials,
//! parsed message, target rule/recipient) and persisted so a process
//! restart does not lose it. The queue is drained FIFO once per scheduler
//! cycle, before any mailbox is polled.

use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::codec::ParsedMessage;
use crate::config::{atomic_write_json, Account};
use crate::errors::AppResult;

const BASE_DELAY_SECS: u64 = 60;
const MAX_DELAY_SECS: u64 = 3600;
const MAX_ATTEMPTS: u32 = 50;

/// One pending redelivery, self-contained so it survives a restart without
/// needing the originating mailbox to still hold the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryItem {
    pub account: Account,
    pub message: ParsedMessage,
    pub rule_name: String,
    pub recipient: String,
    pub include_attachments: bool,
    pub attempts: u32,
    pub next_attempt_epoch: u64,
    pub created_at: String,
}

/// The persisted, FIFO-ordered set of pending redeliveries.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetryQueue {
    items: Vec<RetryItem>,
}

impl RetryQueue {
    pub fn load_or_default(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str(&raw) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to parse retry queue, starting empty");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        atomic_write_json(path, self)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[RetryItem] {
        &self.items
    }

    /// Enqueue a fresh attempt (attempts = 0), due after `BASE_DELAY_SECS`.
    pub fn enqueue(
        &mut self,
        account: Account,
        message: ParsedMessage,
        rule_name: String,
        recipient: String,
        include_attachments: bool,
        now_epoch: u64,
    ) {
        self.items.push(RetryItem {
            account,
            message,
            rule_name,
            recipient,
            include_attachments,
            attempts: 0,
            next_attempt_epoch: now_epoch + BASE_DELAY_SECS,
            created_at: Local::now().to_rfc3339(),
        });
    }

    /// Remove and return every item whose `next_attempt_epoch` has elapsed,
    /// in FIFO order, leaving later-due items in the queue.
    pub fn take_eligible(&mut self, now_epoch: u64) -> Vec<RetryItem> {
        let mut eligible = Vec::new();
        let mut remaining = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.next_attempt_epoch <= now_epoch {
                eligible.push(item);
            } else {
                remaining.push(item);
            }
        }
        self.items = remaining;
        eligible
    }

    /// Re-enqueue an item that failed again, applying exponential backoff.
    /// Returns `false` (and drops the item) once `MAX_ATTEMPTS` is reached.
    pub fn requeue_after_failure(&mut self, mut item: RetryItem, now_epoch: u64) -> bool {
        item.attempts += 1;
        if item.attempts >= MAX_ATTEMPTS {
            return false;
        }
        let backoff = BASE_DELAY_SECS.saturating_mul(1u64 << item.attempts.min(16));
        item.next_attempt_epoch = now_epoch + backoff.min(MAX_DELAY_SECS);
        self.items.push(item);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tempfile::tempdir;

    fn account() -> Account {
        Account {
            name: "a".to_owned(),
            active: true,
            imap_host: "imap.example.com".to_owned(),
            imap_user: "u@example.com".to_owned(),
            imap_password: SecretString::from("p".to_owned()),
            smtp_host: "smtp.example.com".to_owned(),
            smtp_port: 587,
            smtp_user: "u@example.com".to_owned(),
            smtp_password: SecretString::from("p".to_owned()),
            rules: vec![],
        }
    }

    fn message() -> ParsedMessage {
        ParsedMessage {
            from: "x@y.com".to_owned(),
            subject: "s".to_owned(),
            date: "d".to_owned(),
            body_text: "b".to_owned(),
            body_html: String::new(),
            attachments: vec![],
        }
    }

    #[test]
    fn enqueued_item_is_due_after_base_delay() {
        let mut queue = RetryQueue::default();
        queue.enqueue(account(), message(), "r".to_owned(), "dest@z.com".to_owned(), false, 1000);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items()[0].next_attempt_epoch, 1000 + BASE_DELAY_SECS);

        assert!(queue.take_eligible(1000).is_empty());
        let eligible = queue.take_eligible(1000 + BASE_DELAY_SECS);
        assert_eq!(eligible.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn items_due_later_are_left_in_queue() {
        let mut queue = RetryQueue::default();
        queue.enqueue(account(), message(), "r".to_owned(), "dest@z.com".to_owned(), false, 5000);
        let eligible = queue.take_eligible(1000);
        assert!(eligible.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn requeue_applies_exponential_backoff() {
        let mut queue = RetryQueue::default();
        queue.enqueue(account(), message(), "r".to_owned(), "dest@z.com".to_owned(), false, 0);
        let item = queue.take_eligible(BASE_DELAY_SECS).remove(0);
        assert!(queue.requeue_after_failure(item, 0));
        let item = queue.items()[0].clone();
        assert_eq!(item.attempts, 1);
        assert_eq!(item.next_attempt_epoch, BASE_DELAY_SECS * 2);
    }

    #[test]
    fn requeue_caps_delay_at_max() {
        let mut queue = RetryQueue::default();
        let mut item = RetryItem {
            account: account(),
            message: message(),
            rule_name: "r".to_owned(),
            recipient: "dest@z.com".to_owned(),
            include_attachments: false,
            attempts: 10,
            next_attempt_epoch: 0,
            created_at: "now".to_owned(),
        };
        item.attempts = 10;
        assert!(queue.requeue_after_failure(item, 0));
        assert_eq!(queue.items()[0].next_attempt_epoch, MAX_DELAY_SECS);
    }

    #[test]
    fn item_dropped_after_max_attempts() {
        let mut queue = RetryQueue::default();
        let item = RetryItem {
            account: account(),
            message: message(),
            rule_name: "r".to_owned(),
            recipient: "dest@z.com".to_owned(),
            include_attachments: false,
            attempts: MAX_ATTEMPTS - 1,
            next_attempt_epoch: 0,
            created_at: "now".to_owned(),
        };
        assert!(!queue.requeue_after_failure(item, 0));
        assert!(queue.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retry_queue.json");
        let mut queue = RetryQueue::default();
        queue.enqueue(account(), message(), "r".to_owned(), "dest@z.com".to_owned(), false, 42);
        queue.save(&path).unwrap();

        let loaded = RetryQueue::load_or_default(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.items()[0].next_attempt_epoch, 42 + BASE_DELAY_SECS);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retry_queue.json");
        let queue = RetryQueue::load_or_default(&path).unwrap();
        assert!(queue.is_empty());
    }
}
