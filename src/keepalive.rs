//! C5: keep-alive worker
//!
//! A `tokio::time::interval`-driven sweep that keeps C2's session metadata
//! from expiring out from under a still-live pooled handle, and proactively
//! NOOPs handles this instance actually holds so a dead upstream connection
//! is discovered before the next real request hits it (spec §4.5).
//!
//! Each tick walks every non-retired session for both protocols via
//! `scan_active_page`. For sessions this instance owns a live handle for, it
//! issues a protocol NOOP through the pool; everything else just gets its
//! store TTL refreshed. A tick never blocks on a single bad session: each
//! session's refresh/probe runs to completion (or its own op timeout) before
//! moving to the next, and the whole tick emits one summary log line.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::CredentialStore;
use crate::imap_pool::ImapPool;
use crate::privacy::hash_inbox_id;
use crate::session_store::{Protocol, SessionStore, StatField};
use crate::smtp_pool::SmtpPool;

/// Tick outcome, emitted as a single structured log line per sweep.
#[derive(Debug, Default, Clone, Copy)]
struct TickSummary {
    total: u64,
    refreshed: u64,
    noop_ok: u64,
    noop_failed: u64,
    store_errors: u64,
}

/// Run the keep-alive sweep at `interval`, until `shutdown` fires.
///
/// `now_ms` is injected rather than read from `SystemTime` directly so tests
/// can drive deterministic clocks; production callers pass
/// `|| chrono::Utc::now().timestamp_millis()`. When `once` is set, returns
/// after the first tick's sweep instead of looping forever, for the CLI's
/// `--once` single-sweep mode.
pub async fn run(
    store: Arc<dyn SessionStore>,
    imap_pool: Arc<ImapPool>,
    smtp_pool: Arc<SmtpPool>,
    credentials: Arc<CredentialStore>,
    interval: Duration,
    now_ms: impl Fn() -> i64 + Send + Sync + 'static,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    once: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let imap_summary = sweep_protocol(Protocol::Imap, &store, interval, |id| {
                    let pool = Arc::clone(&imap_pool);
                    let id = id.to_owned();
                    async move { pool.noop_if_live(&id).await }
                }, &now_ms).await;
                let smtp_summary = sweep_protocol(Protocol::Smtp, &store, interval, |id| {
                    let pool = Arc::clone(&smtp_pool);
                    let id = id.to_owned();
                    async move { pool.noop_if_live(&id).await }
                }, &now_ms).await;
                check_oauth_expiry(&store, &credentials, now_ms()).await;

                info!(
                    imap_total = imap_summary.total,
                    imap_refreshed = imap_summary.refreshed,
                    imap_noop_ok = imap_summary.noop_ok,
                    imap_noop_failed = imap_summary.noop_failed,
                    smtp_total = smtp_summary.total,
                    smtp_refreshed = smtp_summary.refreshed,
                    smtp_noop_ok = smtp_summary.noop_ok,
                    smtp_noop_failed = smtp_summary.noop_failed,
                    "keepalive tick complete"
                );

                if once {
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("keepalive worker shutting down");
                    return;
                }
            }
        }
    }
}

/// One sweep of every non-retired session for `proto`. Only sessions whose
/// `last_refreshed_at` has fallen behind `ttl_seconds - 2*interval` are
/// probed/touched this tick (spec §4.5 step 2); everything else is already
/// fresh enough to skip, typically because real request traffic is keeping
/// it warm via `MailBridge::record_pool_activity`.
async fn sweep_protocol<F, Fut>(
    proto: Protocol,
    store: &Arc<dyn SessionStore>,
    interval: Duration,
    probe_if_live: F,
    now_ms: &(impl Fn() -> i64 + Send + Sync),
) -> TickSummary
where
    F: Fn(&str) -> Fut,
    Fut: std::future::Future<Output = crate::errors::AppResult<bool>>,
{
    let mut summary = TickSummary::default();
    let mut cursor = 0u64;
    let now = now_ms();
    let refresh_slack_ms = 2 * interval.as_millis() as i64;
    loop {
        let page = match store.scan_active_page(proto, cursor).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, protocol = proto.as_str(), "keepalive scan failed, aborting this protocol's tick");
                summary.store_errors += 1;
                break;
            }
        };
        let (next_cursor, records) = page;

        for (inbox_id_hash, record) in records {
            summary.total += 1;
            let refresh_target_ms = (record.ttl_seconds as i64 * 1_000) - refresh_slack_ms;
            if now - record.last_refreshed_at < refresh_target_ms {
                continue;
            }

            match probe_if_live(&inbox_id_hash).await {
                Ok(true) => {
                    summary.noop_ok += 1;
                    store.incr_stat(proto, &inbox_id_hash, StatField::NoopsOk, 1).await;
                }
                Ok(false) => {
                    // No live handle held by this instance; just keep the
                    // metadata from expiring.
                }
                Err(e) => {
                    summary.noop_failed += 1;
                    store.incr_stat(proto, &inbox_id_hash, StatField::NoopsFail, 1).await;
                    warn!(error = %e, inbox_id_hash = %inbox_id_hash, protocol = proto.as_str(), "keepalive NOOP failed");
                }
            }

            match store.touch(proto, &inbox_id_hash, now, record.ttl_seconds).await {
                Ok(true) => summary.refreshed += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.store_errors += 1;
                    warn!(error = %e, inbox_id_hash = %inbox_id_hash, protocol = proto.as_str(), "keepalive touch failed");
                }
            }
        }

        if next_cursor == 0 {
            break;
        }
        cursor = next_cursor;
    }
    summary
}

/// Spec §4.5 step 4: for every configured OAuth account whose token expires
/// within 60s, emit a `token_expiring_soon` event and mark both the IMAP
/// and SMTP session records `status = refreshing`. Proactive rotation is
/// out of scope; this only surfaces the signal.
async fn check_oauth_expiry(store: &Arc<dyn SessionStore>, credentials: &CredentialStore, now_ms: i64) {
    let now_secs = now_ms / 1_000;
    for (inbox_id, expires_at) in credentials.oauth_accounts_with_expiry() {
        if expires_at - now_secs >= 60 {
            continue;
        }
        let hash = hash_inbox_id(inbox_id);
        info!(inbox_id_hash = %hash, expires_at, event = "token_expiring_soon", "oauth token nearing expiry");
        for proto in [Protocol::Imap, Protocol::Smtp] {
            let _ = store.mark_refreshing(proto, hash.as_str()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::{NullSessionStore, Protocol, SessionRecord};

    #[tokio::test]
    async fn sweep_refreshes_every_active_session() {
        let store: Arc<dyn SessionStore> = Arc::new(NullSessionStore::new());
        for hash in ["aaaa11112222", "bbbb11112222"] {
            store
                .put_new(
                    Protocol::Imap,
                    hash,
                    SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned()),
                )
                .await
                .unwrap();
        }

        let summary = sweep_protocol(
            Protocol::Imap,
            &store,
            Duration::from_millis(1),
            |_id| async { Ok(false) },
            &(|| 400_000i64),
        )
        .await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.refreshed, 2);
        assert_eq!(summary.noop_ok, 0);
    }

    #[tokio::test]
    async fn sweep_counts_noop_failures_without_aborting() {
        let store: Arc<dyn SessionStore> = Arc::new(NullSessionStore::new());
        let hash = "cccc11112222";
        store
            .put_new(
                Protocol::Imap,
                hash,
                SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();

        let summary = sweep_protocol(
            Protocol::Imap,
            &store,
            Duration::from_millis(1),
            |_id| async { Err(crate::errors::AppError::UpstreamUnavailable("down".to_owned())) },
            &(|| 400_000i64),
        )
        .await;

        assert_eq!(summary.noop_failed, 1);
        assert_eq!(summary.refreshed, 1);
    }

    #[tokio::test]
    async fn sweep_skips_sessions_refreshed_recently() {
        let store: Arc<dyn SessionStore> = Arc::new(NullSessionStore::new());
        let hash = "eeee11112222";
        store
            .put_new(
                Protocol::Imap,
                hash,
                SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();

        // Only 5s after creation, well inside ttl_seconds(300) - 2*interval.
        let summary = sweep_protocol(
            Protocol::Imap,
            &store,
            Duration::from_secs(25),
            |_id| async { Ok(true) },
            &(|| 6_000i64),
        )
        .await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(summary.noop_ok, 0);
    }

    #[tokio::test]
    async fn check_oauth_expiry_marks_refreshing_within_60s_of_expiry() {
        use crate::config::{AuthKind, Credentials, CredentialStore};
        use secrecy::SecretString;
        use std::collections::BTreeMap;

        let store: Arc<dyn SessionStore> = Arc::new(NullSessionStore::new());
        let inbox_id = "oauth-user@example.com";
        let hash = hash_inbox_id(inbox_id);
        store
            .put_new(
                Protocol::Imap,
                hash.as_str(),
                SessionRecord::new(hash.to_string(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();

        let mut by_inbox_id = BTreeMap::new();
        by_inbox_id.insert(
            inbox_id.to_owned(),
            Credentials {
                host: "imap.example.com".to_owned(),
                port: 993,
                user: inbox_id.to_owned(),
                secret: SecretString::new("tok".to_owned().into()),
                auth_kind: AuthKind::OAuthBearer,
                token_expires_at: Some(1_030),
            },
        );
        let credentials = CredentialStore::from_map_for_tests(by_inbox_id);

        check_oauth_expiry(&store, &credentials, 1_000_000).await;

        let record = store.get(Protocol::Imap, hash.as_str()).await.unwrap().unwrap();
        assert_eq!(record.status, crate::session_store::SessionStatus::Refreshing);
    }
}
