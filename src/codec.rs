//! Mail codec: MIME header decoding, body/attachment extraction, and
//! outbound multipart message construction.

use std::time::{SystemTime, UNIX_EPOCH};

use lettre::message::header::{
    ContentDisposition, ContentTransferEncoding, ContentType, Header, HeaderName, HeaderValue,
};
use lettre::message::{Body, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use mailparse::{DispositionType, MailHeader, ParsedMail};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Account;
use crate::errors::{AppError, AppResult};

/// Marker prepended to every outbound Subject so mutual forwarding between
/// managed mailboxes is detected and broken. The byte sequence (Greek
/// capital Rho, Latin `C`, Greek capital Beta, colon, space — UTF-8 bytes
/// `CE A1 43 CE 92 3A 20`) is normative: it must not change, or already
/// deployed peers stop recognizing each other's forwards.
pub const FORWARD_MARKER: &str = "\u{03A1}C\u{0392}: ";

const X_MAILER: &str = "mail-forward-gateway/0.1";
const PRODUCT_NAME: &str = "mail-forward-gateway";

/// A single decoded attachment. Carried base64-encoded when persisted in a
/// retry item so a rebuild is self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// A fetched message after MIME decoding, independent of where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub from: String,
    pub subject: String,
    pub date: String,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedMessage {
    /// True if the incoming Subject already carries `FORWARD_MARKER` — this
    /// message is itself a forward from a managed mailbox and must be
    /// discarded before any rule is evaluated.
    pub fn is_forward_loop(&self) -> bool {
        self.subject.contains(FORWARD_MARKER)
    }
}

/// Parse a raw RFC-822 message into headers, body, and attachments.
///
/// Never fails on header decode errors (falls back to lossy UTF-8); a body
/// part that fails to decode is logged and simply left out.
pub fn parse_message(raw: &[u8]) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::internal(format!("failed to parse message: {e}")))?;

    let from = decoded_header(&parsed, "From");
    let subject = decoded_header(&parsed, "Subject");
    let date = decoded_header(&parsed, "Date");

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments);

    Ok(ParsedMessage {
        from,
        subject,
        date,
        body_text: body_text.unwrap_or_default(),
        body_html: body_html.unwrap_or_default(),
        attachments,
    })
}

fn decoded_header(parsed: &ParsedMail<'_>, name: &str) -> String {
    parsed
        .headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case(name))
        .map(decode_header_value)
        .unwrap_or_default()
}

/// Decode one header value: RFC 2047 encoded-words with their declared
/// charset, falling back to lossy UTF-8 if decoding fails. Never panics.
fn decode_header_value(header: &MailHeader<'_>) -> String {
    header.get_value()
}

fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body_text, body_html, attachments);
        }
        return;
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let is_attachment =
        disposition.disposition == DispositionType::Attachment || filename.is_some();

    if is_attachment {
        match part.get_body_raw() {
            Ok(bytes) => attachments.push(Attachment {
                filename,
                content_type: ctype,
                bytes,
            }),
            Err(e) => tracing::warn!(error = %e, "failed to decode attachment body"),
        }
        return;
    }

    if ctype == "text/plain" && body_text.is_none() {
        match part.get_body() {
            Ok(text) => *body_text = Some(text),
            Err(e) => tracing::warn!(error = %e, "failed to decode text/plain body"),
        }
    } else if ctype == "text/html" && body_html.is_none() {
        match part.get_body() {
            Ok(html) => *body_html = Some(html),
            Err(e) => tracing::warn!(error = %e, "failed to decode text/html body"),
        }
    }
}

/// Build the dashed banner prepended to the outbound body. Its shape (two
/// leading blank lines, a named banner, From/Subject/Date, a closing dashed
/// line) is observable to recipients and must be preserved across releases.
fn forward_banner_text(from: &str, subject: &str, date: &str) -> String {
    format!(
        "\n\n--- Message forwarded automatically by {PRODUCT_NAME} ---\n\
         From: {from}\n\
         Original subject: {subject}\n\
         Date: {date}\n\
         ---------------------------------------------------\n\n"
    )
}

fn generate_message_id(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let random_part: String = (0..20)
        .map(|_| char::from_digit(rng.gen_range(0u32..36u32), 36).expect("0..36 is a valid base-36 digit"))
        .collect();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("<{random_part}.{timestamp}@{domain}>")
}

fn raw_header(name: &str, value: String) -> RawHeader {
    RawHeader(
        HeaderName::new_from_ascii(name.to_owned()).expect("header name is a static ASCII literal"),
        value,
    )
}

/// A header whose value we want to emit verbatim without lettre validating
/// or re-parsing it. Only ever constructed for display, never parsed back.
#[derive(Clone)]
struct RawHeader(HeaderName, String);

impl Header for RawHeader {
    fn name() -> HeaderName {
        unimplemented!("display-only header, never parsed")
    }

    fn parse(_: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        unimplemented!("display-only header, never parsed")
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(self.0.clone(), self.1.clone())
    }
}

/// Build a fresh outbound message addressed to a single recipient. Headers
/// (Message-ID, Date, To) are regenerated on every call so each recipient,
/// even on retry, gets its own set.
pub fn build_outbound(
    account: &Account,
    message: &ParsedMessage,
    recipient: &str,
    include_attachments: bool,
) -> AppResult<Message> {
    let from_mailbox: Mailbox = account
        .smtp_user
        .parse()
        .map_err(|e| AppError::SmtpPermanent(format!("invalid From address: {e}")))?;
    let to_mailbox: Mailbox = recipient
        .parse()
        .map_err(|e| AppError::SmtpPermanent(format!("invalid recipient address {recipient}: {e}")))?;

    let domain = account.smtp_user.rsplit('@').next().unwrap_or("localhost");
    let message_id = generate_message_id(domain);
    let subject = format!("{FORWARD_MARKER}{}", message.subject);

    let header_text = forward_banner_text(&message.from, &message.subject, &message.date);
    let body_text_clean = message.body_text.replace("\r\n", "\n").replace('\r', "\n");

    let mut alternative = MultiPart::alternative();
    let mut has_body = false;

    if !body_text_clean.is_empty() {
        alternative = alternative.singlepart(SinglePart::plain(format!("{header_text}{body_text_clean}")));
        has_body = true;
    }

    if !message.body_html.is_empty() {
        let header_html = header_text.replace('\n', "<br>");
        let html_body = if message.body_html.trim_start().starts_with('<') {
            format!("{header_html}{}", message.body_html)
        } else {
            format!("<html><body>{header_html}{}</body></html>", message.body_html)
        };
        alternative = alternative.singlepart(SinglePart::html(html_body));
        has_body = true;
    }

    if !has_body {
        alternative = alternative.singlepart(SinglePart::plain(header_text.clone()));
    }

    let mut mixed = MultiPart::mixed().multipart(alternative);

    if include_attachments {
        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or_else(|_| ContentType::parse("application/octet-stream").expect("static mimetype"));
            let filename = attachment.filename.clone().unwrap_or_else(|| "attachment".to_owned());
            let body = Body::new_with_encoding(attachment.bytes.clone(), ContentTransferEncoding::Base64)
                .map_err(|e| AppError::SmtpPermanent(format!("failed to encode attachment: {e}")))?;
            mixed = mixed.singlepart(
                SinglePart::builder()
                    .header(content_type)
                    .header(ContentDisposition::attachment(&filename))
                    .body(body),
            );
        }
    }

    Message::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(subject)
        .date(SystemTime::now())
        .message_id(Some(message_id))
        .header(raw_header("X-Mailer", X_MAILER.to_owned()))
        .header(raw_header("X-Forwarded-From", message.from.clone()))
        .header(raw_header("X-Original-Date", message.date.clone()))
        .multipart(mixed)
        .map_err(|e| AppError::SmtpPermanent(format!("failed to build outbound message: {e}")))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: sender@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.from, "sender@example.com");
        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.body_text, "Hello there");
        assert!(parsed.attachments.is_empty());
        assert!(!parsed.is_forward_loop());
    }

    #[test]
    fn detects_forward_loop_marker_in_subject() {
        let raw = "From: a@b.com\r\nSubject: \u{3a1}C\u{392}: hello\r\nDate: x\r\n\r\nbody"
            .as_bytes()
            .to_vec();
        let parsed = parse_message(&raw).unwrap();
        assert!(parsed.is_forward_loop());
    }

    #[test]
    fn decodes_rfc2047_encoded_subject() {
        let raw = b"From: a@b.com\r\nSubject: =?UTF-8?B?SG9sYSBtdW5kbw==?=\r\nDate: x\r\n\r\nbody";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.subject, "Hola mundo");
    }

    #[test]
    fn extracts_attachment_from_multipart_mixed() {
        let raw = b"From: a@b.com\r\nSubject: s\r\nDate: d\r\nContent-Type: multipart/mixed; boundary=XYZ\r\n\r\n--XYZ\r\nContent-Type: text/plain\r\n\r\nbody text\r\n--XYZ\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"report.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nJVBERi0xLjQK\r\n--XYZ--\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.body_text, "body text");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename.as_deref(), Some("report.pdf"));
        assert_eq!(parsed.attachments[0].content_type, "application/pdf");
    }

    #[test]
    fn build_outbound_sets_required_headers() {
        let account = Account {
            name: "test".to_owned(),
            active: true,
            imap_host: "imap.example.com".to_owned(),
            imap_user: "user@example.com".to_owned(),
            imap_password: "pw".to_owned().into(),
            smtp_host: "smtp.example.com".to_owned(),
            smtp_port: 587,
            smtp_user: "relay@example.com".to_owned(),
            smtp_password: "pw".to_owned().into(),
            rules: vec![],
        };
        let message = ParsedMessage {
            from: "sender@origin.com".to_owned(),
            subject: "Invoice".to_owned(),
            date: "Wed, 1 Jan 2025 00:00:00 +0000".to_owned(),
            body_text: "hello".to_owned(),
            body_html: String::new(),
            attachments: vec![],
        };

        let built = build_outbound(&account, &message, "dest@z.com", false).unwrap();
        let formatted = String::from_utf8_lossy(&built.formatted()).to_string();
        assert!(formatted.contains("To: dest@z.com"));
        assert!(formatted.contains(&format!("Subject: {FORWARD_MARKER}Invoice")));
        assert!(formatted.contains("Message-ID:"));
        assert!(formatted.contains("X-Forwarded-From: sender@origin.com"));
        assert!(formatted.contains("X-Original-Date: Wed, 1 Jan 2025 00:00:00 +0000"));
    }
}
