//! C6: message transformation
//!
//! Wraps `mime::parse_message` with the RAG-shaping passes the raw parse
//! doesn't do on its own: signature/disclaimer block stripping and tracking
//! pixel removal (both applied to the HTML body before `ammonia::clean`,
//! see `mime.rs`), quote-depth collapsing on the plain text body, and
//! thread id derivation. Every pass is best-effort: a failure in any one of
//! them is recorded in `TransformedMessage::errors` rather than failing the
//! whole message, per the degraded-transform policy.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ProxyConfig;
use crate::errors::AppResult;
use crate::mime::{self, curated_headers};
use crate::models::TransformedMessage;
use crate::thread_id::derive_thread_id;

/// `transform_message(raw, uid, include_all_headers) -> TransformedMessage`
///
/// Never fails outright; a parse failure on the raw RFC822 bytes is the one
/// case that still surfaces as `Err`, since there's no message to produce a
/// degraded result for.
pub fn transform_message(
    raw: &[u8],
    uid: u32,
    include_all_headers: bool,
    include_html: bool,
    config: &ProxyConfig,
) -> AppResult<TransformedMessage> {
    let mut errors = Vec::new();

    let parsed = mime::parse_message(
        raw,
        include_html,
        true,
        config.transformer_attachment_char_limit,
        &config.transformer_tracking_host_patterns,
    )?;

    // Quote collapsing runs on the full body before truncation (spec §4.6:
    // collapse is step 3, truncation is step 6) so a long quoted reply chain
    // doesn't eat the character budget meant for the reply itself.
    let body_text = parsed
        .body_text
        .map(|t| collapse_quotes(&t))
        .map(|t| mime::truncate_chars(t, config.transformer_body_char_limit));
    let body_html = parsed
        .body_html_sanitized
        .map(|h| mime::truncate_chars(h, config.transformer_body_char_limit));

    let header_map: std::collections::BTreeMap<String, String> = parsed
        .headers_all
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    let participants: Vec<String> = [
        header_map.get("from"),
        header_map.get("to"),
        header_map.get("cc"),
    ]
    .into_iter()
    .flatten()
    .flat_map(|v| v.split(','))
    .map(|s| s.trim().to_owned())
    .filter(|s| !s.is_empty())
    .collect();

    let thread_id = derive_thread_id(
        header_map.get("references").map(String::as_str),
        header_map.get("in-reply-to").map(String::as_str),
        parsed.subject.as_deref(),
        &participants,
    );

    for attachment in &parsed.attachments {
        if attachment.extracted_text.is_none() && attachment.content_type == "application/pdf" {
            errors.push(format!(
                "attachment {} ({}): text extraction skipped or failed",
                attachment.part_id, attachment.content_type
            ));
        }
    }

    Ok(TransformedMessage {
        uid,
        thread_id,
        date: parsed.date,
        from: parsed.from,
        to: parsed.to,
        cc: parsed.cc,
        subject: parsed.subject,
        headers: curated_headers(&parsed.headers_all, include_all_headers),
        body_text,
        body_html,
        attachments: parsed.attachments,
        errors,
    })
}

static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));
static ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\b(width|height|src)\s*=\s*["']?([^"'\s>]*)"#).expect("valid regex"));
static SIGNATURE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(div|td|table|p)\b[^>]*\b(?:class|id)\s*=\s*["'][^"']*(signature|email-signature|footer|disclaimer)[^"']*["'][^>]*>.*?</\1>"#)
        .expect("valid regex")
});

/// Remove `<img>` tags that look like tracking pixels: 1x1 (or smaller)
/// dimensions, or a `src` host matching one of `tracking_host_patterns`
/// (plain substring match, patterns are configured hostnames/fragments).
pub fn strip_tracking_pixels(html: &str, tracking_host_patterns: &[String]) -> String {
    IMG_TAG
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let tag = &caps[0];
            if is_tracking_pixel(tag, tracking_host_patterns) {
                String::new()
            } else {
                tag.to_owned()
            }
        })
        .into_owned()
}

fn is_tracking_pixel(img_tag: &str, tracking_host_patterns: &[String]) -> bool {
    let mut width = None;
    let mut height = None;
    let mut src = None;
    for caps in ATTR.captures_iter(img_tag) {
        match caps[1].to_ascii_lowercase().as_str() {
            "width" => width = caps[2].parse::<u32>().ok(),
            "height" => height = caps[2].parse::<u32>().ok(),
            "src" => src = Some(caps[2].to_owned()),
            _ => {}
        }
    }

    if width.is_some_and(|w| w <= 1) && height.is_some_and(|h| h <= 1) {
        return true;
    }
    if let Some(src) = &src
        && tracking_host_patterns.iter().any(|pattern| src.contains(pattern.as_str()))
    {
        return true;
    }
    false
}

/// Remove HTML elements whose `class`/`id` flags them as a signature,
/// disclaimer, or footer block. Regex-based and therefore approximate for
/// nested same-tag structures; acceptable for a best-effort transform.
pub fn strip_signature_blocks(html: &str) -> String {
    SIGNATURE_BLOCK.replace_all(html, "").into_owned()
}

/// Collapse runs of 3+ consecutive `>`-quoted lines into a single
/// placeholder, leaving shallower quoting (a one- or two-line inline reply
/// snippet) untouched.
pub fn collapse_quotes(text: &str) -> String {
    const MIN_DEPTH_TO_COLLAPSE: usize = 3;
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if quote_depth(line) >= MIN_DEPTH_TO_COLLAPSE {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(_start) = run_start.take() {
            out.push("[Quoted text collapsed]".to_owned());
            out.push((*line).to_owned());
        } else {
            out.push((*line).to_owned());
        }
    }
    if run_start.is_some() {
        out.push("[Quoted text collapsed]".to_owned());
    }
    out.join("\n")
}

fn quote_depth(line: &str) -> usize {
    let mut depth = 0;
    let mut chars = line.trim_start().chars().peekable();
    while let Some('>') = chars.peek() {
        depth += 1;
        chars.next();
        if chars.peek() == Some(&' ') {
            chars.next();
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_one_by_one_tracking_pixels() {
        let html = r#"<p>hi</p><img src="https://track.example.com/open.gif" width="1" height="1">"#;
        let out = strip_tracking_pixels(html, &[]);
        assert!(!out.contains("<img"));
        assert!(out.contains("<p>hi</p>"));
    }

    #[test]
    fn strips_images_matching_tracking_host_pattern() {
        let html = r#"<img src="https://mail-tracking.example.com/pixel.png" width="20" height="20">"#;
        let out = strip_tracking_pixels(html, &["mail-tracking.example.com".to_owned()]);
        assert!(!out.contains("<img"));
    }

    #[test]
    fn keeps_normal_sized_images() {
        let html = r#"<img src="https://cdn.example.com/logo.png" width="200" height="50">"#;
        let out = strip_tracking_pixels(html, &[]);
        assert!(out.contains("<img"));
    }

    #[test]
    fn strips_signature_div_by_class() {
        let html = r#"<p>Body</p><div class="email-signature"><p>Best, Alice</p></div>"#;
        let out = strip_signature_blocks(html);
        assert!(!out.contains("Alice"));
        assert!(out.contains("Body"));
    }

    #[test]
    fn strips_plain_footer_div_by_class() {
        let html = r#"<p>Body</p><div class="footer">Unsubscribe here</div>"#;
        let out = strip_signature_blocks(html);
        assert!(!out.contains("Unsubscribe"));
        assert!(out.contains("Body"));
    }

    #[test]
    fn collapses_deep_quote_runs_only() {
        let text = "reply line\n> > one level back\n> > > > > deep 1\n> > > > > deep 2\n> > > > > deep 3\nnew content";
        let out = collapse_quotes(text);
        assert!(out.contains("[Quoted text collapsed]"));
        assert!(out.contains("reply line"));
        assert!(out.contains("new content"));
        assert!(!out.contains("deep 1"));
    }

    #[test]
    fn leaves_shallow_quotes_untouched() {
        let text = "> one level quote\nnormal line";
        let out = collapse_quotes(text);
        assert_eq!(out, text);
    }
}
