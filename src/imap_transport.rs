//! IMAP transport operations
//!
//! Timeout-bounded wrappers around `async-imap`, grounded directly on the
//! teacher crate's `imap.rs`. All network calls use TLS; both `password` and
//! `oauth_bearer` auth kinds are supported (the teacher only needed
//! password LOGIN).

use std::sync::Arc;
use std::time::Duration;

use async_imap::{Authenticator, Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{AuthKind, Credentials};
use crate::errors::{AppError, AppResult};

pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

struct XOAuth2Authenticator {
    user: String,
    token: String,
}

impl Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token)
    }
}

/// Connect to IMAP and authenticate using the auth kind on `credentials`.
///
/// # Timeouts
///
/// - TCP connect: `connect_timeout`
/// - TLS handshake, greeting, and LOGIN/AUTHENTICATE: `greeting_timeout`
///
/// # Errors
///
/// - `UpstreamAuthFailed` if LOGIN/AUTHENTICATE is rejected
/// - `UpstreamUnavailable` if any connection phase times out or the
///   transport fails before authentication completes
pub async fn connect_authenticated(
    credentials: &Credentials,
    connect_timeout: Duration,
    greeting_timeout: Duration,
) -> AppResult<ImapSession> {
    let tcp = timeout(
        connect_timeout,
        TcpStream::connect((credentials.host.as_str(), credentials.port)),
    )
    .await
    .map_err(|_| AppError::UpstreamUnavailable("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(credentials.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::UpstreamUnavailable("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_timeout, client.read_response())
        .await
        .map_err(|_| AppError::UpstreamUnavailable("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("IMAP greeting failed: {e}"))))?;
    if greeting.is_none() {
        return Err(AppError::UpstreamUnavailable(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    match credentials.auth_kind {
        AuthKind::Password => {
            let pass = credentials.secret.expose_secret();
            timeout(greeting_timeout, client.login(credentials.user.as_str(), pass))
                .await
                .map_err(|_| AppError::UpstreamUnavailable("IMAP login timeout".to_owned()))
                .and_then(|r| r.map_err(|(e, _)| AppError::UpstreamAuthFailed(e.to_string())))
        }
        AuthKind::OAuthBearer => {
            let mut authenticator = XOAuth2Authenticator {
                user: credentials.user.clone(),
                token: credentials.secret.expose_secret().to_owned(),
            };
            timeout(
                greeting_timeout,
                client.authenticate("XOAUTH2", &mut authenticator),
            )
            .await
            .map_err(|_| AppError::UpstreamUnavailable("IMAP authenticate timeout".to_owned()))
            .and_then(|r| r.map_err(|(e, _)| AppError::UpstreamAuthFailed(e.to_string())))
        }
    }
}

/// Send NOOP to test connection liveness (health probe, spec §4.3).
pub async fn noop(session: &mut ImapSession, op_timeout: Duration) -> AppResult<()> {
    timeout(op_timeout, session.noop())
        .await
        .map_err(|_| AppError::DeadlineExceeded("NOOP timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("NOOP failed: {e}"))))
}

/// `SELECT INBOX`, performed once per fresh handle (spec §4.3).
pub async fn select_inbox(session: &mut ImapSession, op_timeout: Duration) -> AppResult<()> {
    timeout(op_timeout, session.select("INBOX"))
        .await
        .map_err(|_| AppError::DeadlineExceeded("SELECT INBOX timed out".to_owned()))
        .and_then(|r| {
            r.map(|_| ())
                .map_err(|e| AppError::UpstreamProtocolError(format!("SELECT INBOX failed: {e}")))
        })
}

/// `UID SEARCH ALL`, returning UIDs newest-first.
pub async fn uid_search_all(session: &mut ImapSession, op_timeout: Duration) -> AppResult<Vec<u32>> {
    let set = timeout(op_timeout, session.uid_search("ALL"))
        .await
        .map_err(|_| AppError::DeadlineExceeded("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("UID SEARCH failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

/// `UID FETCH {uid} BODY.PEEK[]`, returning the raw RFC 5322 bytes.
pub async fn fetch_raw_message(
    session: &mut ImapSession,
    op_timeout: Duration,
    uid: u32,
) -> AppResult<Vec<u8>> {
    let stream = timeout(op_timeout, session.uid_fetch(uid.to_string(), "BODY.PEEK[]"))
        .await
        .map_err(|_| AppError::DeadlineExceeded("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("UID FETCH failed: {e}"))))?;
    let fetches: Vec<_> = timeout(op_timeout, stream.try_collect())
        .await
        .map_err(|_| AppError::DeadlineExceeded("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamProtocolError(format!("UID FETCH stream failed: {e}"))))?;

    let fetch = fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))?;
    fetch
        .body()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| AppError::Internal("message has no body".to_owned()))
}

/// Best-effort `LOGOUT`; errors are swallowed, the handle is being discarded.
pub async fn logout(session: &mut ImapSession) {
    let _ = session.logout().await;
}
