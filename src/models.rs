//! Data transfer types returned by the facade (C7) and consumed by its
//! thin HTTP adapter.

use serde::Serialize;

/// Attachment metadata, with best-effort extracted text for small
/// text-like payloads (spec §4.6).
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    pub content_type: String,
    pub size_bytes: usize,
    /// Dotted MIME part path, e.g. `"1.2"`.
    pub part_id: String,
    pub extracted_text: Option<String>,
}

/// One message after C6 transformation: MIME-parsed, HTML-sanitized,
/// signature/tracking-pixel stripped, quote-collapsed, and truncated to
/// the configured character limits.
#[derive(Debug, Clone, Serialize)]
pub struct TransformedMessage {
    pub uid: u32,
    pub thread_id: String,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
    /// Non-fatal problems encountered while transforming this message
    /// (spec §4.6's best-effort degradation policy); an empty vec means a
    /// clean transform.
    pub errors: Vec<String>,
}

/// One page of `list_messages`, spec §4.3/§4.7.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<TransformedMessage>,
    pub next_cursor: Option<String>,
}

/// `send_message`'s result, spec §4.4.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub message_id: String,
}

/// Pool statistics surfaced by `pool_stats`, spec §4.3/§4.4.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsView {
    pub hits: u64,
    pub misses: u64,
    pub live: bool,
    pub noops_ok: u64,
    pub noops_fail: u64,
}
