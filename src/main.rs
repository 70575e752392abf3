//! mailbridge-proxy: connection-pooled IMAP/SMTP proxy for agent clients
//!
//! Maintains one pooled, authenticated IMAP session and one pooled SMTP
//! transport per configured inbox id, persists session metadata across
//! restarts in a Redis-semantics store, keeps both warm with a background
//! NOOP sweep, and hands callers RAG-ready transformed messages instead of
//! raw MIME.
//!
//! # Architecture
//!
//! - [`main`]: process entry point, env/CLI loading, component wiring
//! - [`config`]: environment-driven account credentials and tunables
//! - [`errors`]: application error model
//! - [`privacy`]: inbox id hashing for logs
//! - [`session_store`]: C2, cross-restart session metadata
//! - [`pool`]: generic per-id exclusive connection pool shared by C3/C4
//! - [`imap_transport`] / [`imap_pool`]: C3, IMAP connections
//! - [`smtp_transport`] / [`smtp_pool`]: C4, SMTP connections
//! - [`keepalive`]: C5, background session/handle keep-alive sweep
//! - [`mime`] / [`transform`] / [`thread_id`]: C6, message transformation
//! - [`pagination`]: cursor storage for `list_messages`
//! - [`models`]: facade DTOs
//! - [`handler`]: C7, the `MailBridge` facade
//! - [`http`]: thin external HTTP adapter

mod config;
mod errors;
mod handler;
mod http;
mod imap_pool;
mod imap_transport;
mod keepalive;
mod mime;
mod models;
mod pagination;
mod pool;
mod privacy;
mod session_store;
mod smtp_pool;
mod smtp_transport;
mod thread_id;
mod transform;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{CredentialStore, ProxyConfig};
use handler::MailBridge;

/// Connection-pooled IMAP/SMTP proxy producing RAG-ready message
/// representations for agent clients.
#[derive(Parser, Debug)]
#[command(name = "mailbridge-proxy")]
struct Cli {
    /// Identifies this process in session records; defaults to a random v4 UUID.
    #[arg(long)]
    instance_id: Option<String>,

    /// Run a single keep-alive sweep and exit, instead of serving forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let instance_id = cli.instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let credentials = CredentialStore::load_from_env()?;
    let config = ProxyConfig::load_from_env(instance_id.clone())?;
    info!(instance_id = %instance_id, "mailbridge-proxy starting");

    let session_store =
        session_store::connect_with_fallback(&config.store_url, Duration::from_millis(config.store_op_timeout_ms))
            .await;

    let credentials_arc = Arc::new(credentials.clone());
    let credentials_for_resolve = Arc::clone(&credentials_arc);
    let resolve_credentials: Arc<dyn Fn(&str) -> errors::AppResult<config::Credentials> + Send + Sync> =
        Arc::new(move |inbox_id: &str| {
            let now = chrono::Utc::now().timestamp();
            credentials_for_resolve.resolve(inbox_id, now)
        });

    let imap_pool = Arc::new(imap_pool::new_imap_pool(Arc::clone(&resolve_credentials), &config));
    let smtp_pool = Arc::new(smtp_pool::new_smtp_pool(Arc::clone(&resolve_credentials), &config));

    let bridge = Arc::new(MailBridge::new(
        config.clone(),
        credentials,
        Arc::clone(&session_store),
        Arc::clone(&imap_pool),
        Arc::clone(&smtp_pool),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if cli.once {
        keepalive::run(
            Arc::clone(&session_store),
            Arc::clone(&imap_pool),
            Arc::clone(&smtp_pool),
            Arc::clone(&credentials_arc),
            Duration::from_secs(config.keepalive_interval_seconds),
            || chrono::Utc::now().timestamp_millis(),
            shutdown_rx,
            true,
        )
        .await;
        return Ok(());
    }

    let keepalive_handle = tokio::spawn(keepalive::run(
        Arc::clone(&session_store),
        Arc::clone(&imap_pool),
        Arc::clone(&smtp_pool),
        Arc::clone(&credentials_arc),
        Duration::from_secs(config.keepalive_interval_seconds),
        || chrono::Utc::now().timestamp_millis(),
        shutdown_rx,
        false,
    ));

    let http_handle = config.bearer_token.clone().map(|token| {
        let router = http::router(Arc::clone(&bridge), token);
        let bind_addr = config.http_bind_addr.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(error = %e, addr = %bind_addr, "failed to bind HTTP adapter");
                    return;
                }
            };
            info!(addr = %bind_addr, "HTTP adapter listening");
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "HTTP adapter exited");
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = keepalive_handle.await;
    if let Some(handle) = http_handle {
        handle.abort();
    }

    Ok(())
}
