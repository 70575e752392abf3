//! Configuration and credential resolution (C1)
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAILBRIDGE_ACCOUNT_<SEGMENT>_<KEY>`. Account segments are
//! discovered by scanning for `MAILBRIDGE_ACCOUNT_*_INBOX_ID` variables; the
//! segment name is an arbitrary label, the `INBOX_ID` value is the opaque
//! primary key (conventionally an email address) that every other component
//! keys on.

use std::collections::BTreeMap;
use std::env;
use std::env::VarError;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// How an account authenticates to its upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Password,
    OAuthBearer,
}

/// Immutable credential record for one inbox id, resolved on demand by C1.
///
/// Never persisted by the core; C2 only ever stores session *metadata*,
/// not credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub secret: SecretString,
    pub auth_kind: AuthKind,
    /// Unix seconds; only meaningful when `auth_kind == OAuthBearer`.
    pub token_expires_at: Option<i64>,
}

/// Maps opaque inbox ids to upstream credentials.
///
/// Pure lookup; the only I/O is the environment scan performed once at
/// startup in [`CredentialStore::load_from_env`].
#[derive(Debug, Clone)]
pub struct CredentialStore {
    by_inbox_id: BTreeMap<String, Credentials>,
}

impl CredentialStore {
    #[cfg(test)]
    pub(crate) fn from_map_for_tests(by_inbox_id: BTreeMap<String, Credentials>) -> Self {
        Self { by_inbox_id }
    }

    pub fn load_from_env() -> AppResult<Self> {
        let segment_pattern = Regex::new(r"^MAILBRIDGE_ACCOUNT_([A-Z0-9_]+)_INBOX_ID$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut segments: Vec<String> = env::vars()
            .filter_map(|(k, _)| {
                segment_pattern
                    .captures(&k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();
        segments.sort();
        segments.dedup();

        if segments.is_empty() {
            return Err(AppError::InvalidInput(
                "no accounts configured: set MAILBRIDGE_ACCOUNT_<NAME>_INBOX_ID and friends"
                    .to_owned(),
            ));
        }

        let mut by_inbox_id = BTreeMap::new();
        for seg in segments {
            let (inbox_id, creds) = load_account(&seg)?;
            by_inbox_id.insert(inbox_id, creds);
        }

        Ok(Self { by_inbox_id })
    }

    /// `resolve(inbox_id) -> Credentials | NotFound`
    ///
    /// Refuses to return credentials whose `token_expires_at` has already
    /// passed `now` (unix seconds); returns `CredentialExpired` instead.
    pub fn resolve(&self, inbox_id: &str, now: i64) -> AppResult<Credentials> {
        let creds = self
            .by_inbox_id
            .get(inbox_id)
            .ok_or_else(|| AppError::NotFound(format!("inbox '{inbox_id}' is not configured")))?;

        if let Some(expires_at) = creds.token_expires_at
            && expires_at <= now
        {
            return Err(AppError::CredentialExpired(format!(
                "oauth token for inbox expired at {expires_at}"
            )));
        }

        Ok(creds.clone())
    }

    /// Configured inbox ids whose credentials are OAuth and carry an
    /// expiry, for the keep-alive worker's proactive `token_expiring_soon`
    /// check (spec §4.5 step 4). Pure in-memory iteration, no I/O.
    pub fn oauth_accounts_with_expiry(&self) -> impl Iterator<Item = (&str, i64)> {
        self.by_inbox_id.iter().filter_map(|(inbox_id, creds)| {
            if creds.auth_kind == AuthKind::OAuthBearer {
                creds.token_expires_at.map(|exp| (inbox_id.as_str(), exp))
            } else {
                None
            }
        })
    }
}

fn load_account(segment: &str) -> AppResult<(String, Credentials)> {
    let prefix = format!("MAILBRIDGE_ACCOUNT_{}_", sanitize_segment(segment));
    let inbox_id = required_env(&format!("{prefix}INBOX_ID"))?;
    let host = required_env(&format!("{prefix}HOST"))?;
    let user = required_env(&format!("{prefix}USER"))?;
    let secret = required_env(&format!("{prefix}SECRET"))?;
    let auth_kind = match env::var(format!("{prefix}AUTH_KIND")) {
        Ok(v) if v.eq_ignore_ascii_case("oauth_bearer") => AuthKind::OAuthBearer,
        Ok(v) if v.eq_ignore_ascii_case("password") => AuthKind::Password,
        Ok(v) => {
            return Err(AppError::InvalidInput(format!(
                "invalid {prefix}AUTH_KIND: '{v}' (expected 'password' or 'oauth_bearer')"
            )));
        }
        Err(VarError::NotPresent) => AuthKind::Password,
        Err(VarError::NotUnicode(_)) => {
            return Err(AppError::InvalidInput(format!(
                "{prefix}AUTH_KIND contains non-unicode data"
            )));
        }
    };
    let token_expires_at = match env::var(format!("{prefix}TOKEN_EXPIRES_AT")) {
        Ok(v) => Some(v.parse::<i64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid {prefix}TOKEN_EXPIRES_AT: '{v}'"))
        })?),
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(_)) => {
            return Err(AppError::InvalidInput(format!(
                "{prefix}TOKEN_EXPIRES_AT contains non-unicode data"
            )));
        }
    };

    Ok((
        inbox_id,
        Credentials {
            host,
            port: parse_u16_env(&format!("{prefix}PORT"), 993)?,
            user,
            secret: SecretString::new(secret.into()),
            auth_kind,
            token_expires_at,
        },
    ))
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Tunables for the pool, keep-alive worker, and transformer (spec §6).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Session store connection string (e.g. `redis://127.0.0.1:6379`)
    pub store_url: String,
    pub session_ttl_seconds: u64,
    pub keepalive_interval_seconds: u64,
    pub max_live_handles_per_protocol: usize,
    pub idle_probe_threshold_seconds: u64,
    pub transformer_body_char_limit: usize,
    pub transformer_attachment_char_limit: usize,
    pub transformer_tracking_host_patterns: Vec<String>,
    /// TCP connect phase timeout, shared by IMAP and SMTP pools.
    pub connect_timeout_ms: u64,
    /// TLS handshake + greeting/EHLO timeout.
    pub greeting_timeout_ms: u64,
    /// Per-operation deadline once a session is established (spec §5).
    pub imap_op_timeout_ms: u64,
    pub smtp_op_timeout_ms: u64,
    pub store_op_timeout_ms: u64,
    pub extractor_timeout_ms: u64,
    /// Identifies this process in `Session Record.owner_instance`.
    pub instance_id: String,
    /// Bearer token the thin HTTP adapter checks; `None` disables that router.
    pub bearer_token: Option<String>,
    /// Address the thin HTTP adapter binds to, when `bearer_token` is set.
    pub http_bind_addr: String,
}

impl ProxyConfig {
    pub fn load_from_env(instance_id: String) -> AppResult<Self> {
        Ok(Self {
            store_url: env::var("MAILBRIDGE_STORE_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned()),
            session_ttl_seconds: parse_u64_env("MAILBRIDGE_SESSION_TTL_SECONDS", 300)?,
            keepalive_interval_seconds: parse_u64_env("MAILBRIDGE_KEEPALIVE_INTERVAL_SECONDS", 25)?,
            max_live_handles_per_protocol: parse_usize_env(
                "MAILBRIDGE_MAX_LIVE_HANDLES_PER_PROTOCOL",
                512,
            )?,
            idle_probe_threshold_seconds: parse_u64_env(
                "MAILBRIDGE_IDLE_PROBE_THRESHOLD_SECONDS",
                60,
            )?,
            transformer_body_char_limit: parse_usize_env(
                "MAILBRIDGE_TRANSFORMER_BODY_CHAR_LIMIT",
                5_000,
            )?,
            transformer_attachment_char_limit: parse_usize_env(
                "MAILBRIDGE_TRANSFORMER_ATTACHMENT_CHAR_LIMIT",
                2_000,
            )?,
            transformer_tracking_host_patterns: env::var(
                "MAILBRIDGE_TRANSFORMER_TRACKING_HOST_PATTERNS",
            )
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
            connect_timeout_ms: parse_u64_env("MAILBRIDGE_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env("MAILBRIDGE_GREETING_TIMEOUT_MS", 15_000)?,
            imap_op_timeout_ms: parse_u64_env("MAILBRIDGE_IMAP_OP_TIMEOUT_MS", 15_000)?,
            smtp_op_timeout_ms: parse_u64_env("MAILBRIDGE_SMTP_OP_TIMEOUT_MS", 30_000)?,
            store_op_timeout_ms: parse_u64_env("MAILBRIDGE_STORE_OP_TIMEOUT_MS", 2_000)?,
            extractor_timeout_ms: parse_u64_env("MAILBRIDGE_EXTRACTOR_TIMEOUT_MS", 10_000)?,
            instance_id,
            bearer_token: env::var("MAILBRIDGE_BEARER_TOKEN").ok(),
            http_bind_addr: env::var("MAILBRIDGE_HTTP_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_owned()),
        })
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u16>()
            .map_err(|_| AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|_| AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthKind, Credentials, CredentialStore};
    use secrecy::SecretString;
    use std::collections::BTreeMap;

    fn store_with(inbox_id: &str, creds: Credentials) -> CredentialStore {
        let mut by_inbox_id = BTreeMap::new();
        by_inbox_id.insert(inbox_id.to_owned(), creds);
        CredentialStore { by_inbox_id }
    }

    fn password_creds() -> Credentials {
        Credentials {
            host: "imap.example.com".to_owned(),
            port: 993,
            user: "user@example.com".to_owned(),
            secret: SecretString::new("hunter2".to_owned().into()),
            auth_kind: AuthKind::Password,
            token_expires_at: None,
        }
    }

    #[test]
    fn resolve_unknown_inbox_is_not_found() {
        let store = store_with("a@example.com", password_creds());
        let err = store.resolve("b@example.com", 1_000).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn resolve_password_account_succeeds() {
        let store = store_with("a@example.com", password_creds());
        let creds = store.resolve("a@example.com", 1_000).expect("resolves");
        assert_eq!(creds.host, "imap.example.com");
    }

    #[test]
    fn resolve_expired_oauth_token_is_rejected() {
        let mut creds = password_creds();
        creds.auth_kind = AuthKind::OAuthBearer;
        creds.token_expires_at = Some(500);
        let store = store_with("a@example.com", creds);

        let err = store.resolve("a@example.com", 1_000).unwrap_err();
        assert_eq!(err.kind(), "credential_expired");
    }

    #[test]
    fn oauth_accounts_with_expiry_excludes_password_accounts() {
        let mut oauth_creds = password_creds();
        oauth_creds.auth_kind = AuthKind::OAuthBearer;
        oauth_creds.token_expires_at = Some(2_000);

        let mut by_inbox_id = BTreeMap::new();
        by_inbox_id.insert("oauth@example.com".to_owned(), oauth_creds);
        by_inbox_id.insert("password@example.com".to_owned(), password_creds());
        let store = CredentialStore { by_inbox_id };

        let accounts: Vec<_> = store.oauth_accounts_with_expiry().collect();
        assert_eq!(accounts, vec![("oauth@example.com", 2_000)]);
    }

    #[test]
    fn resolve_not_yet_expired_oauth_token_succeeds() {
        let mut creds = password_creds();
        creds.auth_kind = AuthKind::OAuthBearer;
        creds.token_expires_at = Some(2_000);
        let store = store_with("a@example.com", creds);

        assert!(store.resolve("a@example.com", 1_000).is_ok());
    }
}
