//! C3: IMAP connection pool
//!
//! Supplies the [`ProtocolOps`] impl the generic [`IdKeyedPool`] needs,
//! plus the operations the rest of the crate actually calls: `fetch_recent`
//! (UID SEARCH + UID FETCH for up to `n` newest messages, for a fresh
//! `list_messages` page), `fetch_many` (fetch an already-known UID set for a
//! cursor-continuation page), `fetch_one`, and `stats`. Building a handle
//! performs connect + authenticate + SELECT INBOX in one shot, so a cache
//! hit from `IdKeyedPool::checkout` is always already SELECTed. Each of
//! `fetch_recent`/`fetch_many`/`fetch_one` does exactly one checkout/checkin
//! pair regardless of how many messages it fetches, so callers get one
//! hit/miss observation per pool operation (spec §8 S4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::{Credentials, ProxyConfig};
use crate::errors::AppResult;
use crate::imap_transport::{self, ImapSession};
use crate::pool::{CheckinOutcome, IdKeyedPool, PoolStats, ProtocolOps};
use crate::privacy::hash_inbox_id;

pub struct ImapOps {
    resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
    connect_timeout: Duration,
    greeting_timeout: Duration,
    op_timeout: Duration,
}

impl ImapOps {
    pub fn new(
        resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            resolve_credentials,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            greeting_timeout: Duration::from_millis(config.greeting_timeout_ms),
            op_timeout: Duration::from_millis(config.imap_op_timeout_ms),
        }
    }
}

#[async_trait]
impl ProtocolOps for ImapOps {
    type Handle = ImapSession;

    #[instrument(skip(self), fields(inbox_id_hash = %hash_inbox_id(inbox_id)))]
    async fn build(&self, inbox_id: &str) -> AppResult<Self::Handle> {
        let credentials = (self.resolve_credentials)(inbox_id)?;
        let mut session = imap_transport::connect_authenticated(
            &credentials,
            self.connect_timeout,
            self.greeting_timeout,
        )
        .await?;
        imap_transport::select_inbox(&mut session, self.op_timeout).await?;
        debug!("built fresh IMAP handle");
        Ok(session)
    }

    async fn probe(&self, handle: &mut Self::Handle) -> AppResult<()> {
        imap_transport::noop(handle, self.op_timeout).await
    }

    async fn close(&self, mut handle: Self::Handle) {
        imap_transport::logout(&mut handle).await;
    }
}

/// The type alias the rest of the crate imports instead of spelling out
/// `IdKeyedPool<ImapOps>` everywhere.
pub type ImapPool = IdKeyedPool<ImapOps>;

pub fn new_imap_pool(
    resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
    config: &ProxyConfig,
) -> ImapPool {
    IdKeyedPool::new(
        ImapOps::new(resolve_credentials, config),
        config.max_live_handles_per_protocol,
        Duration::from_secs(config.idle_probe_threshold_seconds),
    )
}

/// One raw fetched message, before MIME transformation.
pub struct RawMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// `fetch_recent(inbox_id, n) -> (was_hit, all_uids_desc, Vec<RawMessage>)`,
/// spec §4.3. `was_hit` reports whether the checkout reused a pooled
/// handle, for C2 hit/miss accounting. `all_uids_desc` is the full
/// newest-first UID set from the search, for seeding a
/// [`crate::pagination::CursorEntry`] so later pages slice into the same
/// snapshot instead of re-searching.
///
/// Checks out the id's handle once, issues `UID SEARCH ALL`, fetches the
/// first `n` of those UIDs, and checks the handle back in — a single
/// checkout for the whole page, not one per message. A fetch failure marks
/// the checkin as `Failed` so the next checkout rebuilds instead of reusing
/// a possibly wedged session.
pub async fn fetch_recent(
    pool: &ImapPool,
    inbox_id: &str,
    n: usize,
    op_timeout: Duration,
) -> AppResult<(bool, Vec<u32>, Vec<RawMessage>)> {
    let mut checkout = pool.checkout(inbox_id).await?;
    let was_hit = checkout.was_hit;
    let result = fetch_recent_inner(checkout.handle_mut(), n, op_timeout).await;
    let outcome = if result.is_ok() { CheckinOutcome::Ok } else { CheckinOutcome::Failed };
    pool.checkin(checkout, outcome).await;
    result.map(|(uids, messages)| (was_hit, uids, messages))
}

async fn fetch_recent_inner(
    session: &mut ImapSession,
    n: usize,
    op_timeout: Duration,
) -> AppResult<(Vec<u32>, Vec<RawMessage>)> {
    let uids = imap_transport::uid_search_all(session, op_timeout).await?;
    let mut messages = Vec::with_capacity(n.min(uids.len()));
    for &uid in uids.iter().take(n) {
        let raw = imap_transport::fetch_raw_message(session, op_timeout, uid).await?;
        messages.push(RawMessage { uid, raw });
    }
    Ok((uids, messages))
}

/// `fetch_many(inbox_id, uids) -> (was_hit, Vec<RawMessage>)`. Fetches a
/// UID set already known from a stored cursor (a `list_messages`
/// continuation page), under a single checkout/checkin pair instead of one
/// per UID.
pub async fn fetch_many(
    pool: &ImapPool,
    inbox_id: &str,
    uids: &[u32],
    op_timeout: Duration,
) -> AppResult<(bool, Vec<RawMessage>)> {
    let mut checkout = pool.checkout(inbox_id).await?;
    let was_hit = checkout.was_hit;
    let result = fetch_many_inner(checkout.handle_mut(), uids, op_timeout).await;
    let outcome = if result.is_ok() { CheckinOutcome::Ok } else { CheckinOutcome::Failed };
    pool.checkin(checkout, outcome).await;
    result.map(|messages| (was_hit, messages))
}

async fn fetch_many_inner(session: &mut ImapSession, uids: &[u32], op_timeout: Duration) -> AppResult<Vec<RawMessage>> {
    let mut out = Vec::with_capacity(uids.len());
    for &uid in uids {
        let raw = imap_transport::fetch_raw_message(session, op_timeout, uid).await?;
        out.push(RawMessage { uid, raw });
    }
    Ok(out)
}

/// `fetch_one(inbox_id, uid) -> (was_hit, RawMessage)`, used by `get_message`.
pub async fn fetch_one(
    pool: &ImapPool,
    inbox_id: &str,
    uid: u32,
    op_timeout: Duration,
) -> AppResult<(bool, RawMessage)> {
    let mut checkout = pool.checkout(inbox_id).await?;
    let was_hit = checkout.was_hit;
    let result = imap_transport::fetch_raw_message(checkout.handle_mut(), op_timeout, uid)
        .await
        .map(|raw| RawMessage { uid, raw });
    let outcome = if result.is_ok() { CheckinOutcome::Ok } else { CheckinOutcome::Failed };
    pool.checkin(checkout, outcome).await;
    result.map(|msg| (was_hit, msg))
}

pub async fn stats(pool: &ImapPool, inbox_id: &str) -> PoolStats {
    pool.local_stats(inbox_id).await
}
