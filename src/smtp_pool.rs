//! C4: SMTP connection pool
//!
//! Same contract shape as C3 (spec §4.4): per-id exclusivity, health-probe,
//! LRU eviction all come from the shared [`IdKeyedPool`]; this module only
//! supplies the `lettre`-specific [`ProtocolOps`] impl and the `send`
//! operation callers actually use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::{Credentials, ProxyConfig};
use crate::errors::AppResult;
use crate::pool::{CheckinOutcome, IdKeyedPool, PoolStats, ProtocolOps};
use crate::privacy::hash_inbox_id;
use crate::smtp_transport::{self, OutboundMessage, SmtpTransport};

pub struct SmtpOps {
    resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl SmtpOps {
    pub fn new(
        resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            resolve_credentials,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            op_timeout: Duration::from_millis(config.smtp_op_timeout_ms),
        }
    }
}

#[async_trait]
impl ProtocolOps for SmtpOps {
    type Handle = SmtpTransport;

    #[instrument(skip(self), fields(inbox_id_hash = %hash_inbox_id(inbox_id)))]
    async fn build(&self, inbox_id: &str) -> AppResult<Self::Handle> {
        let credentials = (self.resolve_credentials)(inbox_id)?;
        let transport = smtp_transport::build_transport(&credentials, self.connect_timeout)?;
        smtp_transport::probe(&transport, self.op_timeout).await?;
        debug!("built fresh SMTP handle");
        Ok(transport)
    }

    async fn probe(&self, handle: &mut Self::Handle) -> AppResult<()> {
        smtp_transport::probe(handle, self.op_timeout).await
    }

    async fn close(&self, _handle: Self::Handle) {
        // lettre's pooled transport has no explicit close; dropping it
        // tears down any cached connection.
    }
}

pub type SmtpPool = IdKeyedPool<SmtpOps>;

pub fn new_smtp_pool(
    resolve_credentials: Arc<dyn Fn(&str) -> AppResult<Credentials> + Send + Sync>,
    config: &ProxyConfig,
) -> SmtpPool {
    IdKeyedPool::new(
        SmtpOps::new(resolve_credentials, config),
        config.max_live_handles_per_protocol,
        Duration::from_secs(config.idle_probe_threshold_seconds),
    )
}

/// `send(inbox_id, outbound) -> (was_hit, MessageId)`, spec §4.4.
///
/// A submit failure marks the checkin `Failed`, forcing the next send to
/// rebuild the transport rather than risk reusing a relay connection in an
/// unknown state after a partial DATA command.
pub async fn send(
    pool: &SmtpPool,
    inbox_id: &str,
    from: &str,
    outbound: &OutboundMessage,
    op_timeout: Duration,
) -> AppResult<(bool, String)> {
    let mut checkout = pool.checkout(inbox_id).await?;
    let was_hit = checkout.was_hit;
    let result = smtp_transport::send(checkout.handle_mut(), from, outbound, op_timeout).await;
    let outcome = if result.is_ok() { CheckinOutcome::Ok } else { CheckinOutcome::Failed };
    pool.checkin(checkout, outcome).await;
    result.map(|message_id| (was_hit, message_id))
}

pub async fn stats(pool: &SmtpPool, inbox_id: &str) -> PoolStats {
    pool.local_stats(inbox_id).await
}
