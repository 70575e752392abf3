//! C7: facade
//!
//! `MailBridge` is the single entry point the rest of the crate (and the
//! thin HTTP adapter in `http.rs`) calls through. It owns nothing about the
//! wire protocol; its job is purely to sequence C1 (credential resolution),
//! C2 (session metadata), C3/C4 (pools), and C6 (transform) for each of the
//! four operations spec.md names: `list_messages`, `get_message`,
//! `send_message`, `pool_stats`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::{CredentialStore, ProxyConfig};
use crate::errors::{AppError, AppResult};
use crate::imap_pool::{self, ImapPool};
use crate::models::{MessagePage, PoolStatsView, SendResult, TransformedMessage};
use crate::pagination::{CursorEntry, CursorStore};
use crate::privacy::hash_inbox_id;
use crate::session_store::{Protocol, SessionRecord, SessionStore, StatField};
use crate::smtp_pool::{self, SmtpPool};
use crate::smtp_transport::OutboundMessage;
use crate::transform::transform_message;

pub struct MailBridge {
    config: ProxyConfig,
    credentials: CredentialStore,
    session_store: Arc<dyn SessionStore>,
    imap_pool: Arc<ImapPool>,
    smtp_pool: Arc<SmtpPool>,
    cursors: Mutex<CursorStore>,
}

impl MailBridge {
    pub fn new(
        config: ProxyConfig,
        credentials: CredentialStore,
        session_store: Arc<dyn SessionStore>,
        imap_pool: Arc<ImapPool>,
        smtp_pool: Arc<SmtpPool>,
    ) -> Self {
        Self {
            cursors: Mutex::new(CursorStore::new(config.session_ttl_seconds, 4_096)),
            config,
            credentials,
            session_store,
            imap_pool,
            smtp_pool,
        }
    }

    fn imap_op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.imap_op_timeout_ms)
    }

    fn smtp_op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.smtp_op_timeout_ms)
    }

    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// `list_messages(inbox_id, cursor, page_size) -> MessagePage`, spec §4.3/§4.7.
    ///
    /// A fresh `cursor` (or its absence) triggers a new `UID SEARCH`;
    /// providing a previously returned cursor slices into that snapshot
    /// without re-searching, so pages stay consistent even if new mail
    /// arrives mid-pagination. Either path does exactly one pool
    /// checkout/checkin for the whole page, so hit/miss accounting reflects
    /// one pool operation per `list_messages` call regardless of page size
    /// (spec §8 S4).
    #[instrument(skip(self), fields(inbox_id_hash = %hash_inbox_id(inbox_id)))]
    pub async fn list_messages(
        &self,
        inbox_id: &str,
        cursor: Option<&str>,
        page_size: usize,
        include_all_headers: bool,
        include_html: bool,
    ) -> AppResult<MessagePage> {
        self.credentials.resolve(inbox_id, self.now_ms() / 1000)?;

        let (uids_desc, offset, was_hit, raws) = match cursor {
            Some(token) => {
                let entry = self
                    .cursors
                    .lock()
                    .await
                    .get(token)
                    .ok_or_else(|| AppError::InvalidInput("cursor not found or expired".to_owned()))?;
                if entry.inbox_id != inbox_id {
                    return Err(AppError::InvalidInput("cursor does not belong to this inbox".to_owned()));
                }
                let page_uids: Vec<u32> = entry.uids_desc.iter().skip(entry.offset).take(page_size).copied().collect();
                let (was_hit, raws) =
                    imap_pool::fetch_many(&self.imap_pool, inbox_id, &page_uids, self.imap_op_timeout()).await?;
                (entry.uids_desc, entry.offset, was_hit, raws)
            }
            None => {
                let (was_hit, uids_desc, raws) =
                    imap_pool::fetch_recent(&self.imap_pool, inbox_id, page_size, self.imap_op_timeout()).await?;
                (uids_desc, 0, was_hit, raws)
            }
        };
        self.record_pool_activity(Protocol::Imap, inbox_id, was_hit).await;

        let mut messages = Vec::with_capacity(raws.len());
        for raw in raws {
            messages.push(transform_message(&raw.raw, raw.uid, include_all_headers, include_html, &self.config)?);
        }

        let next_offset = offset + messages.len();
        let next_cursor = if next_offset < uids_desc.len() {
            let mut cursors = self.cursors.lock().await;
            Some(cursors.create(CursorEntry {
                inbox_id: inbox_id.to_owned(),
                uids_desc,
                offset: next_offset,
                expires_at: Instant::now(),
            }))
        } else {
            None
        };

        Ok(MessagePage { messages, next_cursor })
    }

    /// `get_message(inbox_id, uid) -> TransformedMessage`, spec §4.3.
    #[instrument(skip(self), fields(inbox_id_hash = %hash_inbox_id(inbox_id)))]
    pub async fn get_message(
        &self,
        inbox_id: &str,
        uid: u32,
        include_all_headers: bool,
        include_html: bool,
    ) -> AppResult<TransformedMessage> {
        self.credentials.resolve(inbox_id, self.now_ms() / 1000)?;
        let (was_hit, raw) = imap_pool::fetch_one(&self.imap_pool, inbox_id, uid, self.imap_op_timeout()).await?;
        self.record_pool_activity(Protocol::Imap, inbox_id, was_hit).await;
        transform_message(&raw.raw, raw.uid, include_all_headers, include_html, &self.config)
    }

    /// `send_message(inbox_id, outbound) -> SendResult`, spec §4.4.
    #[instrument(skip(self, outbound), fields(inbox_id_hash = %hash_inbox_id(inbox_id)))]
    pub async fn send_message(&self, inbox_id: &str, outbound: OutboundMessage) -> AppResult<SendResult> {
        let credentials = self.credentials.resolve(inbox_id, self.now_ms() / 1000)?;
        let (was_hit, message_id) = smtp_pool::send(
            &self.smtp_pool,
            inbox_id,
            &credentials.user,
            &outbound,
            self.smtp_op_timeout(),
        )
        .await?;
        self.record_pool_activity(Protocol::Smtp, inbox_id, was_hit).await;
        Ok(SendResult { message_id })
    }

    /// `pool_stats(inbox_id) -> (imap, smtp)`, spec §4.3/§4.4.
    pub async fn pool_stats(&self, inbox_id: &str) -> (PoolStatsView, PoolStatsView) {
        let imap_local = imap_pool::stats(&self.imap_pool, inbox_id).await;
        let smtp_local = smtp_pool::stats(&self.smtp_pool, inbox_id).await;
        let hash = hash_inbox_id(inbox_id);

        let imap_record = self.session_store.get(Protocol::Imap, hash.as_str()).await.ok().flatten();
        let smtp_record = self.session_store.get(Protocol::Smtp, hash.as_str()).await.ok().flatten();

        (
            merge_stats(imap_local, imap_record),
            merge_stats(smtp_local, smtp_record),
        )
    }

    /// Ensure C2 has a session record for this (protocol, inbox) pair and
    /// bump its hit/miss counters, mirroring what `checkout` just did
    /// locally. Store failures are logged and swallowed by
    /// `SessionStore::incr_stat`/`put_new`'s own non-fatal contract.
    async fn record_pool_activity(&self, proto: Protocol, inbox_id: &str, was_hit: bool) {
        let hash = hash_inbox_id(inbox_id);
        let now_ms = self.now_ms();

        if self
            .session_store
            .get(proto, hash.as_str())
            .await
            .ok()
            .flatten()
            .is_none()
        {
            let _ = self
                .session_store
                .put_new(
                    proto,
                    hash.as_str(),
                    SessionRecord::new(hash.to_string(), now_ms, self.config.session_ttl_seconds, self.config.instance_id.clone()),
                )
                .await;
        }

        let field = if was_hit { StatField::Hits } else { StatField::Misses };
        self.session_store.incr_stat(proto, hash.as_str(), field, 1).await;
        let _ = self
            .session_store
            .touch(proto, hash.as_str(), now_ms, self.config.session_ttl_seconds)
            .await;
    }
}

/// The session store holds the authoritative hit/miss/noop counters
/// (spec §4.3/§4.5's "never sum from in-memory caches" posture, and §8 S5
/// restart survival); the in-memory pool only contributes `live`, and backs
/// up hits/misses when the store itself is unavailable (§8 S7).
fn merge_stats(local: crate::pool::PoolStats, record: Option<SessionRecord>) -> PoolStatsView {
    match record {
        Some(r) => PoolStatsView {
            hits: r.stats.hits,
            misses: r.stats.misses,
            live: local.live,
            noops_ok: r.stats.noops_ok,
            noops_fail: r.stats.noops_fail,
        },
        None => PoolStatsView {
            hits: local.hits,
            misses: local.misses,
            live: local.live,
            noops_ok: 0,
            noops_fail: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStats;
    use crate::session_store::{SessionStats, SessionStatus};

    fn record_with_stats(stats: SessionStats) -> SessionRecord {
        SessionRecord {
            inbox_id_hash: "abcdef012345".to_owned(),
            created_at: 0,
            last_used_at: 0,
            last_refreshed_at: 0,
            ttl_seconds: 300,
            status: SessionStatus::Active,
            owner_instance: "inst-a".to_owned(),
            stats,
        }
    }

    /// Spec §8 S5 (restart survival): after a restart the in-memory pool's
    /// hits/misses reset to zero, but `pool_stats` must still report the
    /// persisted counters rather than the freshly-reset in-memory ones.
    #[test]
    fn merge_stats_prefers_persisted_counters_over_reset_in_memory_ones() {
        let local = PoolStats { hits: 0, misses: 0, live: false };
        let record = record_with_stats(SessionStats {
            hits: 19,
            misses: 1,
            noops_ok: 3,
            noops_fail: 0,
        });

        let view = merge_stats(local, Some(record));
        assert_eq!(view.hits, 19);
        assert_eq!(view.misses, 1);
        assert_eq!(view.noops_ok, 3);
        assert!(!view.live);
    }

    /// Spec §8 S7 (store outage): with no persisted record at all, fall
    /// back to whatever the in-memory pool has observed this process.
    #[test]
    fn merge_stats_falls_back_to_in_memory_counters_when_store_unavailable() {
        let local = PoolStats { hits: 4, misses: 1, live: true };

        let view = merge_stats(local, None);
        assert_eq!(view.hits, 4);
        assert_eq!(view.misses, 1);
        assert!(view.live);
        assert_eq!(view.noops_ok, 0);
        assert_eq!(view.noops_fail, 0);
    }
}
