//! Top-level polling cycle.
//!
//! Runs on its own OS thread: drain the retry queue, then poll every
//! active account once, then sleep for the configured interval. No async
//! runtime — a cycle is just a loop making blocking calls on this thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::context::ServiceContext;
use crate::{codec, delivery, mailbox};

/// Run scheduler cycles until `shutdown` is set. Intended to be spawned on
/// its own thread by `main`.
pub fn run(ctx: ServiceContext, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = now_epoch();

        drain_retry_queue(&ctx, now);

        let accounts = match ctx.config.lock() {
            Ok(config) => config.accounts.clone(),
            Err(e) => {
                ctx.logs.log_error(&format!("poisoned configuration lock: {e}"));
                Vec::new()
            }
        };

        for account in accounts.iter().filter(|a| a.active) {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            mailbox::process_account(&ctx, account, now_epoch());
        }

        let interval = ctx
            .config
            .lock()
            .map(|c| c.interval_seconds)
            .unwrap_or(60)
            .max(1);
        sleep_respecting_shutdown(Duration::from_secs(interval), &shutdown);
    }
}

fn sleep_respecting_shutdown(total: Duration, shutdown: &Arc<AtomicBool>) {
    const TICK: Duration = Duration::from_millis(500);
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(TICK);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Attempt every due retry item once. Failures are requeued with backoff;
/// items exceeding the attempt cap are dropped and logged.
fn drain_retry_queue(ctx: &ServiceContext, now: u64) {
    let due = match ctx.retry_queue.lock() {
        Ok(mut queue) => queue.take_eligible(now),
        Err(e) => {
            ctx.logs.log_error(&format!("poisoned retry queue lock: {e}"));
            return
        }
    };

    if due.is_empty() {
        return;
    }

    let mut changed = false;
    for item in due {
        let failures = delivery::deliver_to_recipients(
            &item.account,
            |recipient| {
                codec::build_outbound(&item.account, &item.message, recipient, item.include_attachments)
            },
            std::slice::from_ref(&item.recipient),
        );

        if failures.is_empty() {
            ctx.logs
                .log_forwarded(&item.message.subject, &item.rule_name, &item.recipient);
            changed = true;
            continue;
        }

        let transient = failures[0].1.is_transient();
        if transient {
            let rule_name = item.rule_name.clone();
            let recipient = item.recipient.clone();
            if let Ok(mut queue) = ctx.retry_queue.lock() {
                if !queue.requeue_after_failure(item, now) {
                    ctx.logs.log_error(&format!(
                        "rule '{rule_name}': giving up on {recipient} after max retry attempts"
                    ));
                }
            }
        } else {
            let (_, error) = &failures[0];
            ctx.logs.log_error(&format!(
                "rule '{}': permanent failure delivering to {}: {error}",
                item.rule_name, item.recipient
            ));
        }
        changed = true;
    }

    if changed {
        if let Err(e) = ctx.save_retry_queue() {
            ctx.logs.log_error(&format!("failed to persist retry queue: {e}"));
        }
    }
}
