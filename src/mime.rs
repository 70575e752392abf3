//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts body text/HTML,
//! and handles attachments. Sanitizes HTML with `ammonia`, decodes
//! non-UTF-8 text attachments with `encoding_rs`, and supports optional PDF
//! text extraction. `transform.rs` layers signature stripping, tracking
//! pixel removal, and quote collapsing on top of what this module produces.

use std::collections::BTreeMap;

use encoding_rs::Encoding;
use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::AttachmentInfo;

/// Parsed message representation
///
/// Contains extracted headers, body content, and attachment metadata.
/// Body text/HTML are returned at full length; `transform.rs` truncates
/// them after quote collapsing, per spec §4.6's pipeline ordering.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed To header
    pub to: Option<String>,
    /// Parsed Cc header
    pub cc: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
    /// All headers as key-value pairs
    pub headers_all: Vec<(String, String)>,
    /// Plain text body (untruncated)
    pub body_text: Option<String>,
    /// Sanitized HTML body (untruncated)
    pub body_html_sanitized: Option<String>,
    /// Attachment metadata
    pub attachments: Vec<AttachmentInfo>,
}

/// Parse RFC822 message into structured representation
///
/// Extracts headers, body text/HTML, and attachment info. Sanitizes
/// HTML and optionally extracts text from PDF attachments.
///
/// # Parameters
///
/// - `raw`: RFC822 message bytes
/// - `include_html`: Whether to include HTML body
/// - `extract_attachment_text`: Whether to extract text from PDFs
/// - `attachment_text_max_chars`: Maximum characters for extracted PDF text
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn parse_message(
    raw: &[u8],
    include_html: bool,
    extract_attachment_text: bool,
    attachment_text_max_chars: usize,
    tracking_host_patterns: &[String],
) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = parse_all_headers(raw)?;
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    walk_parts(
        &parsed,
        "1".to_owned(),
        &mut body_text,
        &mut body_html,
        &mut attachments,
        extract_attachment_text,
        attachment_text_max_chars,
        tracking_host_patterns,
    )?;

    let text = body_text.or_else(|| body_html.as_deref().map(html_to_plain_text));
    let html = if include_html { body_html } else { None };

    let header_map = to_header_map(&headers);
    Ok(ParsedMessage {
        date: header_map.get("date").cloned(),
        from: header_map.get("from").cloned(),
        to: header_map.get("to").cloned(),
        cc: header_map.get("cc").cloned(),
        subject: header_map.get("subject").cloned(),
        headers_all: headers,
        body_text: text,
        body_html_sanitized: html,
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Traverses all MIME parts to extract text/plain, text/html bodies,
/// and attachment metadata. Handles multipart structures correctly.
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
    extract_attachment_text: bool,
    attachment_text_max_chars: usize,
    tracking_host_patterns: &[String],
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if !is_attachment {
            if ctype == "text/plain"
                && body_text.is_none()
                && let Ok(text) = part.get_body()
            {
                *body_text = Some(text);
            }

            if ctype == "text/html"
                && body_html.is_none()
                && let Ok(html) = part.get_body()
            {
                let html = crate::transform::strip_signature_blocks(&html);
                let html = crate::transform::strip_tracking_pixels(&html, tracking_host_patterns);
                *body_html = Some(ammonia::clean(&html));
            }
        }

        if is_attachment {
            let raw_body = part
                .get_body_raw()
                .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
            let mut extracted_text = None;
            if extract_attachment_text && raw_body.len() <= 5_000_000 {
                if ctype == "application/pdf" {
                    if let Ok(text) = pdf_extract::extract_text_from_mem(&raw_body) {
                        extracted_text = Some(truncate_chars(text, attachment_text_max_chars));
                    }
                } else if ctype.starts_with("text/") {
                    let charset = &part.ctype.charset;
                    let text = decode_with_charset(&raw_body, charset);
                    extracted_text = Some(truncate_chars(text, attachment_text_max_chars));
                }
            }

            attachments.push(AttachmentInfo {
                filename,
                content_type: ctype,
                size_bytes: raw_body.len(),
                part_id,
                extracted_text,
            });
        }

        return Ok(());
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        let next_id = format!("{part_id}.{}", idx + 1);
        walk_parts(
            sub,
            next_id,
            body_text,
            body_html,
            attachments,
            extract_attachment_text,
            attachment_text_max_chars,
            tracking_host_patterns,
        )?;
    }
    Ok(())
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Return headers, either curated or all
///
/// If `include_all=true`, returns all headers. Otherwise, returns only
/// a safe subset (Date, From, To, Cc, Subject, Message-ID).
pub fn curated_headers(headers: &[(String, String)], include_all: bool) -> Vec<(String, String)> {
    if include_all {
        return headers.to_vec();
    }

    let allowed = ["date", "from", "to", "cc", "subject", "message-id"];
    headers
        .iter()
        .filter(|(k, _)| allowed.contains(&k.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

/// Parse header bytes into key-value pairs
pub fn parse_header_bytes(header_bytes: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Parse all headers from raw message
fn parse_all_headers(raw: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}

/// Degrade a sanitized HTML body to plain text when the message has no
/// `text/plain` part at all (spec §4.6 step 1: "otherwise degrade HTML ->
/// text"). Best-effort: rendering failure yields an empty string rather
/// than propagating, consistent with the transformer's degrade-don't-fail
/// policy.
fn html_to_plain_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100).unwrap_or_default()
}

/// Decode attachment bytes using the charset declared on its Content-Type,
/// falling back to UTF-8 (with lossy replacement) for unrecognized labels.
fn decode_with_charset(raw: &[u8], charset_label: &str) -> String {
    let encoding = Encoding::for_label(charset_label.as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(raw);
    text.into_owned()
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences. When
/// clipping actually occurs, appends a `…` suffix and a trailing
/// `[truncated]` marker line so callers can tell a short body from a clipped
/// one; untruncated input is returned unchanged.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push('…');
    out.push_str("\n[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::{curated_headers, parse_message, truncate_chars};

    #[test]
    fn truncates_unicode_by_character_and_marks_the_clip() {
        let input = "a\u{1F600}b\u{1F600}c".to_owned();
        let out = truncate_chars(input, 4);
        assert_eq!(out, "a\u{1F600}b\u{1F600}…\n[truncated]");
    }

    #[test]
    fn leaves_short_input_unmarked() {
        let input = "short".to_owned();
        let out = truncate_chars(input.clone(), 10);
        assert_eq!(out, input);
    }

    #[test]
    fn curated_headers_filters_unless_include_all() {
        let headers = vec![
            (
                "Date".to_owned(),
                "Wed, 1 Jan 2025 00:00:00 +0000".to_owned(),
            ),
            ("From".to_owned(), "sender@example.com".to_owned()),
            ("X-Custom".to_owned(), "value".to_owned()),
        ];

        let curated = curated_headers(&headers, false);
        assert_eq!(curated.len(), 2);
        assert!(curated.iter().any(|(k, _)| k.eq_ignore_ascii_case("date")));
        assert!(curated.iter().any(|(k, _)| k.eq_ignore_ascii_case("from")));

        let all = curated_headers(&headers, true);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_message(raw, false, false, 10000, &[]).expect("parse should succeed");

        assert_eq!(parsed.subject.as_deref(), Some("Hi"));
        assert_eq!(parsed.from.as_deref(), Some("sender@example.com"));
        assert_eq!(parsed.to.as_deref(), Some("user@example.com"));
        assert_eq!(parsed.body_text.as_deref(), Some("Hello there"));
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn degrades_html_to_text_when_no_plain_part() {
        let raw = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\nContent-Type: text/html\r\n\r\n<p>Hello there</p>";
        let parsed = parse_message(raw, false, false, 10000, &[]).expect("parse should succeed");

        let body = parsed.body_text.expect("degraded body present");
        assert!(body.contains("Hello there"));
    }
}
