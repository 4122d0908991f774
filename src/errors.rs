//! Application error model.
//!
//! A single typed hierarchy used throughout the engine so call sites can
//! match on variant instead of string-sniffing. `Transient` vs `Permanent`
//! drives the retry-queue decision in [`crate::delivery`].

use thiserror::Error;

/// Application error type covering every failure mode the engine encounters.
#[derive(Debug, Error)]
pub enum AppError {
    /// Filesystem or network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config/retry-queue document could not be parsed or serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IMAP failure that is worth abandoning the account for this cycle
    /// (connection refused, TLS failure, login failure, fetch failure).
    #[error("imap error: {0}")]
    Imap(String),

    /// SMTP failure classified as transient (network error, timeout, DNS
    /// failure, SMTP protocol error) — the caller should enqueue a retry.
    #[error("transient smtp error: {0}")]
    SmtpTransient(String),

    /// SMTP failure classified as permanent (unencodable content,
    /// programming error) — the caller should log and drop, not retry.
    #[error("permanent smtp error: {0}")]
    SmtpPermanent(String),

    /// Malformed request, configuration, or argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Requested resource (account, log type) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else: mail parsing failures, poisoned mutex, etc.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this failure should cause the caller to enqueue a retry
    /// rather than drop the recipient outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SmtpTransient(_) | Self::Io(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for AppError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("poisoned lock: {e}"))
    }
}

pub type AppResult<T> = Result<T, AppError>;
