//! Session store (C2)
//!
//! A typed wrapper over a Redis-semantics key/value store holding session
//! *metadata* (never credentials). All mutating operations are atomic with
//! respect to a single session key; multi-key transactions and distributed
//! locks are deliberately out of reach (spec §5's shared-resource policy).
//!
//! Storage layout: one hash per session at `session:{protocol}:{hash}`, all
//! numeric fields as decimal strings, unknown fields on read ignored for
//! forward compatibility.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Which upstream protocol a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Imap,
    Smtp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Smtp => "smtp",
        }
    }
}

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Refreshing,
    Retired,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Refreshing => "refreshing",
            Self::Retired => "retired",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "refreshing" => Self::Refreshing,
            "retired" => Self::Retired,
            _ => Self::Active,
        }
    }
}

/// Atomic-increment-only counters tracked per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub hits: u64,
    pub misses: u64,
    pub noops_ok: u64,
    pub noops_fail: u64,
}

/// Which stat field `incr_stat` bumps.
#[derive(Debug, Clone, Copy)]
pub enum StatField {
    Hits,
    Misses,
    NoopsOk,
    NoopsFail,
}

impl StatField {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hits => "hits",
            Self::Misses => "misses",
            Self::NoopsOk => "noops_ok",
            Self::NoopsFail => "noops_fail",
        }
    }
}

/// Session metadata persisted in C2; keyed by `(protocol, inbox_id_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub inbox_id_hash: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub last_refreshed_at: i64,
    pub ttl_seconds: u64,
    pub status: SessionStatus,
    pub owner_instance: String,
    pub stats: SessionStats,
}

impl SessionRecord {
    pub fn new(inbox_id_hash: String, now_ms: i64, ttl_seconds: u64, owner_instance: String) -> Self {
        Self {
            inbox_id_hash,
            created_at: now_ms,
            last_used_at: now_ms,
            last_refreshed_at: now_ms,
            ttl_seconds,
            status: SessionStatus::Active,
            owner_instance,
            stats: SessionStats::default(),
        }
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("inbox_id_hash", self.inbox_id_hash.clone()),
            ("created_at", self.created_at.to_string()),
            ("last_used_at", self.last_used_at.to_string()),
            ("last_refreshed_at", self.last_refreshed_at.to_string()),
            ("ttl_seconds", self.ttl_seconds.to_string()),
            ("status", self.status.as_str().to_owned()),
            ("owner_instance", self.owner_instance.clone()),
            ("hits", self.stats.hits.to_string()),
            ("misses", self.stats.misses.to_string()),
            ("noops_ok", self.stats.noops_ok.to_string()),
            ("noops_fail", self.stats.noops_fail.to_string()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get_u64 = |k: &str| fields.get(k).and_then(|v| v.parse::<u64>().ok());
        let get_i64 = |k: &str| fields.get(k).and_then(|v| v.parse::<i64>().ok());

        Some(Self {
            inbox_id_hash: fields.get("inbox_id_hash")?.clone(),
            created_at: get_i64("created_at")?,
            last_used_at: get_i64("last_used_at")?,
            last_refreshed_at: get_i64("last_refreshed_at")?,
            ttl_seconds: get_u64("ttl_seconds")?,
            status: SessionStatus::parse(fields.get("status").map(String::as_str).unwrap_or("active")),
            owner_instance: fields.get("owner_instance").cloned().unwrap_or_default(),
            stats: SessionStats {
                hits: get_u64("hits").unwrap_or(0),
                misses: get_u64("misses").unwrap_or(0),
                noops_ok: get_u64("noops_ok").unwrap_or(0),
                noops_fail: get_u64("noops_fail").unwrap_or(0),
            },
        })
    }
}

fn session_key(proto: Protocol, inbox_id_hash: &str) -> String {
    format!("session:{}:{inbox_id_hash}", proto.as_str())
}

/// The C2 contract. Implemented by [`RedisSessionStore`] for production use
/// and by [`NullSessionStore`] as the memory-only degraded mode (spec §4.2's
/// "store unavailability is non-fatal" failure mode).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<Option<SessionRecord>>;

    /// Returns `true` if created, `false` if a record already existed.
    async fn put_new(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        record: SessionRecord,
    ) -> AppResult<bool>;

    /// Resets expiry and `last_used_at`/`last_refreshed_at`. Returns `false`
    /// if the record is missing.
    async fn touch(&self, proto: Protocol, inbox_id_hash: &str, now_ms: i64, ttl_seconds: u64)
    -> AppResult<bool>;

    /// Returns `false` if the record was already missing.
    async fn mark_retired(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool>;

    /// Marks `status = refreshing` without retiring the record: the
    /// keep-alive worker's proactive signal that an OAuth token on this
    /// inbox is about to expire (spec §4.5 step 4). Returns `false` if the
    /// record is missing.
    async fn mark_refreshing(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool>;

    /// Server-side atomic increment. Never fails the caller's request; on
    /// error the failure is logged and dropped.
    async fn incr_stat(&self, proto: Protocol, inbox_id_hash: &str, field: StatField, delta: i64);

    /// One page of a restartable SCAN over non-retired sessions for `proto`.
    /// `cursor` starts at `0`; the returned cursor is `0` when iteration is
    /// complete. Tolerates concurrent mutation (may skip or duplicate) and
    /// never loops internally, so it cannot hang.
    async fn scan_active_page(
        &self,
        proto: Protocol,
        cursor: u64,
    ) -> AppResult<(u64, Vec<(String, SessionRecord)>)>;
}

/// Production [`SessionStore`] backed by Redis.
pub struct RedisSessionStore {
    conn: Mutex<ConnectionManager>,
    op_timeout: Duration,
}

impl RedisSessionStore {
    pub async fn connect(store_url: &str, op_timeout: Duration) -> AppResult<Self> {
        let client = redis::Client::open(store_url)
            .map_err(|e| AppError::StoreUnavailable(format!("invalid store url: {e}")))?;
        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| AppError::StoreUnavailable("store connect timed out".to_owned()))?
            .map_err(|e| AppError::StoreUnavailable(format!("store connect failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            op_timeout,
        })
    }

    async fn set_status(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        status: &'static str,
        op_name: &'static str,
    ) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let script = Script::new(
            r"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'status', ARGV[1])
            return 1
            ",
        );
        let mut conn = self.conn.lock().await;
        let ok: i64 = timeout(
            self.op_timeout,
            script.key(&key).arg(status).invoke_async(&mut *conn),
        )
        .await
        .map_err(|_| AppError::StoreUnavailable(format!("{op_name} timed out")))?
        .map_err(|e| AppError::StoreUnavailable(format!("{op_name} failed: {e}")))?;
        Ok(ok == 1)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<Option<SessionRecord>> {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn.lock().await;
        let fields: HashMap<String, String> = timeout(self.op_timeout, conn.hgetall(&key))
            .await
            .map_err(|_| AppError::StoreUnavailable("GET timed out".to_owned()))?
            .map_err(|e| AppError::StoreUnavailable(format!("HGETALL failed: {e}")))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(SessionRecord::from_fields(&fields))
    }

    async fn put_new(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        record: SessionRecord,
    ) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let ttl = record.ttl_seconds;
        let mut script = Script::new(
            r"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            redis.call('HSET', KEYS[1], unpack(ARGV, 1, #ARGV - 1))
            redis.call('EXPIRE', KEYS[1], ARGV[#ARGV])
            return 1
            ",
        )
        .key(&key);
        for (field, value) in record.to_fields() {
            script = script.arg(field).arg(value);
        }
        script = script.arg(ttl);

        let mut conn = self.conn.lock().await;
        let created: i64 = timeout(self.op_timeout, script.invoke_async(&mut *conn))
            .await
            .map_err(|_| AppError::StoreUnavailable("PUT_NEW timed out".to_owned()))?
            .map_err(|e| AppError::StoreUnavailable(format!("PUT_NEW failed: {e}")))?;
        Ok(created == 1)
    }

    async fn touch(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        now_ms: i64,
        ttl_seconds: u64,
    ) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let script = Script::new(
            r"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'last_used_at', ARGV[1], 'last_refreshed_at', ARGV[1])
            redis.call('EXPIRE', KEYS[1], ARGV[2])
            return 1
            ",
        );
        let mut conn = self.conn.lock().await;
        let ok: i64 = timeout(
            self.op_timeout,
            script
                .key(&key)
                .arg(now_ms)
                .arg(ttl_seconds)
                .invoke_async(&mut *conn),
        )
        .await
        .map_err(|_| AppError::StoreUnavailable("TOUCH timed out".to_owned()))?
        .map_err(|e| AppError::StoreUnavailable(format!("TOUCH failed: {e}")))?;
        Ok(ok == 1)
    }

    async fn mark_retired(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool> {
        self.set_status(proto, inbox_id_hash, "retired", "MARK_RETIRED").await
    }

    async fn mark_refreshing(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool> {
        self.set_status(proto, inbox_id_hash, "refreshing", "MARK_REFRESHING").await
    }

    async fn incr_stat(&self, proto: Protocol, inbox_id_hash: &str, field: StatField, delta: i64) {
        let key = session_key(proto, inbox_id_hash);
        let mut conn = self.conn.lock().await;
        let result: Result<i64, _> = timeout(
            self.op_timeout,
            conn.hincr(&key, field.as_str(), delta),
        )
        .await
        .map_err(|_| "incr_stat timed out".to_owned())
        .and_then(|r| r.map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(error = %e, key = %key, field = field.as_str(), "incr_stat failed, dropping");
        }
    }

    async fn scan_active_page(
        &self,
        proto: Protocol,
        cursor: u64,
    ) -> AppResult<(u64, Vec<(String, SessionRecord)>)> {
        let pattern = format!("session:{}:*", proto.as_str());
        let mut conn = self.conn.lock().await;
        let (next_cursor, keys): (u64, Vec<String>) = timeout(
            self.op_timeout,
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn),
        )
        .await
        .map_err(|_| AppError::StoreUnavailable("SCAN timed out".to_owned()))?
        .map_err(|e| AppError::StoreUnavailable(format!("SCAN failed: {e}")))?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> = timeout(self.op_timeout, conn.hgetall(&key))
                .await
                .map_err(|_| AppError::StoreUnavailable("SCAN HGETALL timed out".to_owned()))?
                .map_err(|e| AppError::StoreUnavailable(format!("SCAN HGETALL failed: {e}")))?;
            let Some(record) = SessionRecord::from_fields(&fields) else {
                continue;
            };
            if record.status == SessionStatus::Retired {
                continue;
            }
            out.push((record.inbox_id_hash.clone(), record));
        }
        Ok((next_cursor, out))
    }
}

/// Memory-only fallback used when the store is unreachable. Every operation
/// succeeds against an in-process map so request handling degrades rather
/// than fails; nothing here survives a restart, which is the point.
#[derive(Default)]
pub struct NullSessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl NullSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn get(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<Option<SessionRecord>> {
        let key = session_key(proto, inbox_id_hash);
        Ok(self.records.lock().await.get(&key).cloned())
    }

    async fn put_new(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        record: SessionRecord,
    ) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let mut guard = self.records.lock().await;
        if guard.contains_key(&key) {
            return Ok(false);
        }
        guard.insert(key, record);
        Ok(true)
    }

    async fn touch(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        now_ms: i64,
        ttl_seconds: u64,
    ) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let mut guard = self.records.lock().await;
        let Some(record) = guard.get_mut(&key) else {
            return Ok(false);
        };
        record.last_used_at = now_ms;
        record.last_refreshed_at = now_ms;
        record.ttl_seconds = ttl_seconds;
        Ok(true)
    }

    async fn mark_retired(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let mut guard = self.records.lock().await;
        let Some(record) = guard.get_mut(&key) else {
            return Ok(false);
        };
        record.status = SessionStatus::Retired;
        Ok(true)
    }

    async fn mark_refreshing(&self, proto: Protocol, inbox_id_hash: &str) -> AppResult<bool> {
        let key = session_key(proto, inbox_id_hash);
        let mut guard = self.records.lock().await;
        let Some(record) = guard.get_mut(&key) else {
            return Ok(false);
        };
        record.status = SessionStatus::Refreshing;
        Ok(true)
    }

    async fn incr_stat(&self, proto: Protocol, inbox_id_hash: &str, field: StatField, delta: i64) {
        let key = session_key(proto, inbox_id_hash);
        let mut guard = self.records.lock().await;
        if let Some(record) = guard.get_mut(&key) {
            let target = match field {
                StatField::Hits => &mut record.stats.hits,
                StatField::Misses => &mut record.stats.misses,
                StatField::NoopsOk => &mut record.stats.noops_ok,
                StatField::NoopsFail => &mut record.stats.noops_fail,
            };
            *target = target.saturating_add_signed(delta);
        }
    }

    async fn scan_active_page(
        &self,
        proto: Protocol,
        _cursor: u64,
    ) -> AppResult<(u64, Vec<(String, SessionRecord)>)> {
        let prefix = format!("session:{}:", proto.as_str());
        let guard = self.records.lock().await;
        let page = guard
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .filter(|(_, v)| v.status != SessionStatus::Retired)
            .map(|(_, v)| (v.inbox_id_hash.clone(), v.clone()))
            .collect();
        Ok((0, page))
    }
}

/// Connect to Redis, degrading to [`NullSessionStore`] (and logging
/// `store_unreachable`) if the connection attempt fails, per spec §4.2's
/// non-fatal failure mode.
pub async fn connect_with_fallback(
    store_url: &str,
    op_timeout: Duration,
) -> Arc<dyn SessionStore> {
    match RedisSessionStore::connect(store_url, op_timeout).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, event = "store_unreachable", "falling back to memory-only session store");
            Arc::new(NullSessionStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_cold_then_warm_hit_sequence() {
        let store = NullSessionStore::new();
        let hash = "abcdef012345";

        let created = store
            .put_new(
                Protocol::Imap,
                hash,
                SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .expect("put_new succeeds");
        assert!(created);

        store.incr_stat(Protocol::Imap, hash, StatField::Misses, 1).await;
        for _ in 0..5 {
            store.incr_stat(Protocol::Imap, hash, StatField::Hits, 1).await;
        }

        let record = store
            .get(Protocol::Imap, hash)
            .await
            .expect("get succeeds")
            .expect("record exists");
        assert_eq!(record.stats.hits, 5);
        assert_eq!(record.stats.misses, 1);
    }

    #[tokio::test]
    async fn put_new_does_not_overwrite_existing_record() {
        let store = NullSessionStore::new();
        let hash = "abcdef012345";
        let rec = SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned());

        assert!(store.put_new(Protocol::Imap, hash, rec.clone()).await.unwrap());
        assert!(!store.put_new(Protocol::Imap, hash, rec).await.unwrap());
    }

    #[tokio::test]
    async fn touch_missing_record_reports_false() {
        let store = NullSessionStore::new();
        assert!(!store.touch(Protocol::Imap, "nope", 1_000, 300).await.unwrap());
    }

    #[tokio::test]
    async fn mark_refreshing_updates_status_without_removing_from_scan() {
        let store = NullSessionStore::new();
        let hash = "dddddddddddd";
        store
            .put_new(
                Protocol::Imap,
                hash,
                SessionRecord::new(hash.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();

        assert!(store.mark_refreshing(Protocol::Imap, hash).await.unwrap());
        let record = store.get(Protocol::Imap, hash).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Refreshing);

        let (_, page) = store.scan_active_page(Protocol::Imap, 0).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn scan_active_skips_retired_sessions() {
        let store = NullSessionStore::new();
        let active = "aaaaaaaaaaaa";
        let retired = "bbbbbbbbbbbb";
        store
            .put_new(
                Protocol::Imap,
                active,
                SessionRecord::new(active.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();
        store
            .put_new(
                Protocol::Imap,
                retired,
                SessionRecord::new(retired.to_owned(), 1_000, 300, "inst-a".to_owned()),
            )
            .await
            .unwrap();
        store.mark_retired(Protocol::Imap, retired).await.unwrap();

        let (next, page) = store.scan_active_page(Protocol::Imap, 0).await.unwrap();
        assert_eq!(next, 0);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, active);
    }
}
