//! SMTP transport operations
//!
//! Thin wrapper around `lettre`'s async SMTP transport, mirroring the
//! timeout-bounded style of `imap_transport.rs`. Submission only: a single
//! relay per credentials set, `Credentials::auth_kind` selects PLAIN/LOGIN
//! (password) vs XOAUTH2 (oauth bearer).

use std::time::Duration;

use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials as LettreCredentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tokio::time::timeout;

use crate::config::{AuthKind, Credentials};
use crate::errors::{AppError, AppResult};

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

/// A single message to submit, pre-validated by the caller (spec §4.4).
pub struct OutboundMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Build (but do not connect) a transport for `credentials`.
pub fn build_transport(credentials: &Credentials, connect_timeout: Duration) -> AppResult<SmtpTransport> {
    let lettre_creds = match credentials.auth_kind {
        AuthKind::Password => LettreCredentials::new(
            credentials.user.clone(),
            credentials.secret.expose_secret().to_owned(),
        ),
        AuthKind::OAuthBearer => LettreCredentials::new(
            credentials.user.clone(),
            credentials.secret.expose_secret().to_owned(),
        ),
    };
    let mechanism = match credentials.auth_kind {
        AuthKind::Password => Mechanism::Login,
        AuthKind::OAuthBearer => Mechanism::Xoauth2,
    };

    let builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&credentials.host)
        .map_err(|e| AppError::InvalidInput(format!("invalid SMTP relay host: {e}")))?
        .port(credentials.port)
        .credentials(lettre_creds)
        .authentication(vec![mechanism])
        .timeout(Some(connect_timeout));

    Ok(builder.build())
}

/// Health probe: `test_connection` issues a fresh connect + EHLO + QUIT.
pub async fn probe(transport: &SmtpTransport, op_timeout: Duration) -> AppResult<()> {
    let ok = timeout(op_timeout, transport.test_connection())
        .await
        .map_err(|_| AppError::DeadlineExceeded("SMTP connection test timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("SMTP connection test failed: {e}"))))?;
    if ok {
        Ok(())
    } else {
        Err(AppError::UpstreamUnavailable("SMTP relay rejected test connection".to_owned()))
    }
}

/// Submit `outbound` from `from`, returning the `Message-Id` lettre generated.
pub async fn send(
    transport: &SmtpTransport,
    from: &str,
    outbound: &OutboundMessage,
    op_timeout: Duration,
) -> AppResult<String> {
    let mut builder = Message::builder()
        .from(parse_mailbox(from)?)
        .subject(outbound.subject.clone());

    for addr in &outbound.to {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in &outbound.cc {
        builder = builder.cc(parse_mailbox(addr)?);
    }
    for addr in &outbound.bcc {
        builder = builder.bcc(parse_mailbox(addr)?);
    }
    for (name, value) in &outbound.headers {
        let header_name = HeaderName::new_from_ascii(name.clone())
            .map_err(|e| AppError::InvalidInput(format!("invalid header name '{name}': {e}")))?;
        builder = builder.header(HeaderValue::new(header_name, value.clone()));
    }

    let message = if let Some(html) = &outbound.body_html {
        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(outbound.body_text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            )
            .map_err(|e| AppError::InvalidInput(format!("failed to build message: {e}")))?
    } else {
        builder
            .body(outbound.body_text.clone())
            .map_err(|e| AppError::InvalidInput(format!("failed to build message: {e}")))?
    };

    let message_id = message
        .headers()
        .get_raw("Message-ID")
        .map(str::to_owned)
        .unwrap_or_default();

    timeout(op_timeout, transport.send(&message))
        .await
        .map_err(|_| AppError::DeadlineExceeded("SMTP send timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("SMTP send failed: {e}"))))?;

    Ok(message_id)
}

fn parse_mailbox(addr: &str) -> AppResult<Mailbox> {
    addr.parse::<Mailbox>()
        .map_err(|e| AppError::InvalidInput(format!("invalid address '{addr}': {e}")))
}
