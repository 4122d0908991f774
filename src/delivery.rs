//! Delivery sequencer: sends one built message per recipient over SMTP,
//! classifying failures as transient (worth a retry) or permanent (log and
//! drop) so the caller can decide whether to enqueue.

use std::thread;
use std::time::Duration;

use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::Account;
use crate::errors::{AppError, AppResult};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
const INTER_SEND_DELAY: Duration = Duration::from_secs(3);

/// Send `message` to every recipient in `recipients`, one at a time with a
/// pause between sends so a burst of matches doesn't hammer the relay.
///
/// Returns the list of recipients whose send failed, paired with the
/// classified error, in the same order they were attempted. A caller with
/// an empty `recipients` list gets an empty result back — there is nothing
/// to do.
pub fn deliver_to_recipients(
    account: &Account,
    build: impl Fn(&str) -> AppResult<Message>,
    recipients: &[String],
) -> Vec<(String, AppError)> {
    let mut failures = Vec::new();
    if recipients.is_empty() {
        return failures;
    }

    let transport = match build_transport(account) {
        Ok(t) => t,
        Err(e) => {
            return recipients.iter().map(|r| (r.clone(), clone_err(&e))).collect();
        }
    };

    for (i, recipient) in recipients.iter().enumerate() {
        if i > 0 {
            thread::sleep(INTER_SEND_DELAY);
        }
        match build(recipient).and_then(|msg| send_one(&transport, &msg)) {
            Ok(()) => {}
            Err(e) => failures.push((recipient.clone(), e)),
        }
    }

    failures
}

fn build_transport(account: &Account) -> AppResult<SmtpTransport> {
    let transport = SmtpTransport::starttls_relay(&account.smtp_host)
        .map_err(|e| AppError::SmtpTransient(format!("failed to resolve smtp relay {}: {e}", account.smtp_host)))?
        .port(account.smtp_port)
        .timeout(Some(SMTP_TIMEOUT))
        .authentication(vec![Mechanism::Plain, Mechanism::Login])
        .credentials(Credentials::new(
            account.smtp_user.clone(),
            account.smtp_password.expose_secret().to_owned(),
        ))
        .build();
    Ok(transport)
}

fn send_one(transport: &SmtpTransport, message: &Message) -> AppResult<()> {
    transport
        .send(message)
        .map(|_| ())
        .map_err(classify_smtp_error)
}

fn classify_smtp_error(error: lettre::transport::smtp::Error) -> AppError {
    if error.is_permanent() {
        AppError::SmtpPermanent(error.to_string())
    } else {
        AppError::SmtpTransient(error.to_string())
    }
}

fn clone_err(e: &AppError) -> AppError {
    match e {
        AppError::SmtpTransient(s) => AppError::SmtpTransient(s.clone()),
        AppError::SmtpPermanent(s) => AppError::SmtpPermanent(s.clone()),
        other => AppError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParsedMessage;
    use secrecy::SecretString;

    fn account() -> Account {
        Account {
            name: "a".to_owned(),
            active: true,
            imap_host: "imap.example.com".to_owned(),
            imap_user: "u@example.com".to_owned(),
            imap_password: SecretString::from("p".to_owned()),
            smtp_host: "smtp.invalid".to_owned(),
            smtp_port: 587,
            smtp_user: "u@example.com".to_owned(),
            smtp_password: SecretString::from("p".to_owned()),
            rules: vec![],
        }
    }

    #[test]
    fn empty_recipient_list_is_a_no_op() {
        let acc = account();
        let message = ParsedMessage {
            from: "a@b.com".to_owned(),
            subject: "s".to_owned(),
            date: "d".to_owned(),
            body_text: "b".to_owned(),
            body_html: String::new(),
            attachments: vec![],
        };
        let failures = deliver_to_recipients(
            &acc,
            |recipient| crate::codec::build_outbound(&acc, &message, recipient, false),
            &[],
        );
        assert!(failures.is_empty());
    }
}
