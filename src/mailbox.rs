//! Mailbox processor: one IMAPS session per active account per cycle.
//!
//! Connects, selects INBOX, fetches every unseen message, evaluates it
//! against that account's rules, dispatches matches over SMTP (or enqueues
//! a retry on transient failure), then flags the source message deleted
//! and expunges. A failure anywhere in one account's pass is logged and
//! isolated — it never aborts the cycle for the remaining accounts.

use imap::Session;
use secrecy::ExposeSecret;

use crate::codec::{self, ParsedMessage};
use crate::config::Account;
use crate::context::ServiceContext;
use crate::delivery;
use crate::errors::{AppError, AppResult};
use crate::rules;

const IMAP_PORT: u16 = 993;

/// Run one polling pass over `account`: fetch unseen mail, evaluate rules,
/// dispatch matches, mark processed messages deleted, expunge.
pub fn process_account(ctx: &ServiceContext, account: &Account, now_epoch: u64) {
    match run(ctx, account, now_epoch) {
        Ok(count) => {
            if count > 0 {
                ctx.logs.log_trace(
                    verbose(ctx),
                    &format!("account '{}': processed {count} unseen message(s)", account.name),
                );
            }
        }
        Err(e) => {
            ctx.logs
                .log_error(&format!("account '{}': {e}", account.name));
        }
    }
}

fn verbose(ctx: &ServiceContext) -> bool {
    ctx.config
        .lock()
        .map(|c| c.verbose_logging)
        .unwrap_or(false)
}

fn run(ctx: &ServiceContext, account: &Account, now_epoch: u64) -> AppResult<usize> {
    let mut session = connect(account)?;
    session
        .select("INBOX")
        .map_err(|e| AppError::Imap(format!("select INBOX failed: {e}")))?;

    let uids = session
        .uid_search("UNSEEN")
        .map_err(|e| AppError::Imap(format!("UNSEEN search failed: {e}")))?;

    let mut processed = 0;
    for uid in uids {
        if let Err(e) = process_one(ctx, account, &mut session, uid, now_epoch) {
            ctx.logs
                .log_error(&format!("account '{}', message uid {uid}: {e}", account.name));
            continue;
        }
        processed += 1;
    }

    session
        .expunge()
        .map_err(|e| AppError::Imap(format!("expunge failed: {e}")))?;
    let _ = session.logout();

    Ok(processed)
}

fn connect(account: &Account) -> AppResult<Session<imap::Connection>> {
    let client = imap::ClientBuilder::new(account.imap_host.as_str(), IMAP_PORT)
        .native_tls()
        .map_err(|e| AppError::Imap(format!("tls connect to {} failed: {e}", account.imap_host)))?;
    client
        .login(&account.imap_user, account.imap_password.expose_secret())
        .map_err(|(e, _)| AppError::Imap(format!("login failed: {e}")))
}

/// Connect, log in, and immediately log out. Used by the control RPC's
/// `test_connection` command to validate a set of credentials without
/// touching the mailbox.
pub fn test_login(account: &Account) -> AppResult<()> {
    let mut session = connect(account)?;
    let _ = session.logout();
    Ok(())
}

fn process_one(
    ctx: &ServiceContext,
    account: &Account,
    session: &mut Session<imap::Connection>,
    uid: u32,
    now_epoch: u64,
) -> AppResult<()> {
    let fetched = session
        .uid_fetch(uid.to_string(), "RFC822")
        .map_err(|e| AppError::Imap(format!("fetch uid {uid} failed: {e}")))?;
    let Some(fetch) = fetched.iter().next() else {
        return Ok(());
    };
    let Some(raw) = fetch.body() else {
        return Ok(());
    };

    let message = codec::parse_message(raw)?;
    if message.is_forward_loop() {
        ctx.logs.log_trace(
            verbose(ctx),
            &format!("account '{}': dropping already-forwarded message uid {uid}", account.name),
        );
        mark_deleted(session, uid)?;
        return Ok(());
    }

    dispatch(ctx, account, &message, now_epoch);
    mark_deleted(session, uid)
}

fn mark_deleted(session: &mut Session<imap::Connection>, uid: u32) -> AppResult<()> {
    session
        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
        .map_err(|e| AppError::Imap(format!("flagging uid {uid} deleted failed: {e}")))?;
    Ok(())
}

/// Evaluate every active rule against `message` and dispatch to every
/// matching rule's recipients, enqueueing a retry for any transient
/// delivery failure.
fn dispatch(ctx: &ServiceContext, account: &Account, message: &ParsedMessage, now_epoch: u64) {
    for rule in &account.rules {
        if !rules::matches(message, rule) {
            continue;
        }

        let failures = delivery::deliver_to_recipients(
            account,
            |recipient| codec::build_outbound(account, message, recipient, rule.include_attachments),
            &rule.recipients,
        );

        let failed: std::collections::HashSet<&str> =
            failures.iter().map(|(r, _)| r.as_str()).collect();
        for recipient in &rule.recipients {
            if !failed.contains(recipient.as_str()) {
                ctx.logs.log_forwarded(&message.subject, &rule.name, recipient);
            }
        }

        for (recipient, error) in failures {
            if error.is_transient() {
                if let Ok(mut queue) = ctx.retry_queue.lock() {
                    queue.enqueue(
                        account.clone(),
                        message.clone(),
                        rule.name.clone(),
                        recipient.clone(),
                        rule.include_attachments,
                        now_epoch,
                    );
                }
                let _ = ctx.save_retry_queue();
            }
            ctx.logs.log_error(&format!(
                "rule '{}': delivery to {recipient} failed: {error}",
                rule.name
            ));
        }
    }
}
