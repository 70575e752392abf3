//! Thin HTTP adapter over [`MailBridge`]
//!
//! An external collaborator binding, not part of the core contract (spec
//! §7): a single bearer token gates every route, request/response bodies
//! are `serde_json`, and `AppError::kind()` maps to a status code here and
//! nowhere else in the crate.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::errors::AppError;
use crate::handler::MailBridge;
use crate::smtp_transport::OutboundMessage;

#[derive(Clone)]
struct AppState {
    bridge: Arc<MailBridge>,
    bearer_token: String,
}

pub fn router(bridge: Arc<MailBridge>, bearer_token: String) -> Router {
    let state = AppState { bridge, bearer_token };
    Router::new()
        .route("/inboxes/{inbox_id}/messages", get(list_messages))
        .route("/inboxes/{inbox_id}/messages/{uid}", get(get_message))
        .route("/inboxes/{inbox_id}/messages", post(send_message))
        .route("/inboxes/{inbox_id}/pool-stats", get(pool_stats))
        .with_state(state)
}

fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let ok = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);
    if ok {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response())
    }
}

fn status_for(err: &AppError) -> StatusCode {
    match err.kind() {
        "invalid_input" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "credential_expired" | "upstream_auth_failed" => StatusCode::UNAUTHORIZED,
        "upstream_unavailable" | "store_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "deadline_exceeded" => StatusCode::GATEWAY_TIMEOUT,
        "upstream_protocol_error" | "transform_degraded" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: AppError) -> Response {
    let status = status_for(&err);
    (status, Json(serde_json::json!({ "error": err.kind(), "message": err.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    cursor: Option<String>,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default)]
    include_all_headers: bool,
    #[serde(default)]
    include_html: bool,
}

fn default_page_size() -> usize {
    25
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(inbox_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(resp) = check_bearer(&headers, &state.bearer_token) {
        return resp;
    }
    match state
        .bridge
        .list_messages(
            &inbox_id,
            query.cursor.as_deref(),
            query.page_size,
            query.include_all_headers,
            query.include_html,
        )
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct GetMessageQuery {
    #[serde(default)]
    include_all_headers: bool,
    #[serde(default)]
    include_html: bool,
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((inbox_id, uid)): Path<(String, u32)>,
    Query(query): Query<GetMessageQuery>,
) -> Response {
    if let Err(resp) = check_bearer(&headers, &state.bearer_token) {
        return resp;
    }
    match state
        .bridge
        .get_message(&inbox_id, uid, query.include_all_headers, query.include_html)
        .await
    {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SendMessageBody {
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    bcc: Vec<String>,
    subject: String,
    body_text: String,
    body_html: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(inbox_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    if let Err(resp) = check_bearer(&headers, &state.bearer_token) {
        return resp;
    }
    let outbound = OutboundMessage {
        to: body.to,
        cc: body.cc,
        bcc: body.bcc,
        subject: body.subject,
        body_text: body.body_text,
        body_html: body.body_html,
        headers: body.headers,
    };
    match state.bridge.send_message(&inbox_id, outbound).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

async fn pool_stats(State(state): State<AppState>, headers: HeaderMap, Path(inbox_id): Path<String>) -> Response {
    if let Err(resp) = check_bearer(&headers, &state.bearer_token) {
        return resp;
    }
    let (imap, smtp) = state.bridge.pool_stats(&inbox_id).await;
    Json(serde_json::json!({ "imap": imap, "smtp": smtp })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_bearer_token() {
        let headers = HeaderMap::new();
        assert!(check_bearer(&headers, "expected").is_err());
    }

    #[test]
    fn rejects_mismatched_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_bearer(&headers, "expected").is_err());
    }

    #[test]
    fn accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer expected".parse().unwrap());
        assert!(check_bearer(&headers, "expected").is_ok());
    }

    #[test]
    fn maps_error_kinds_to_expected_status_codes() {
        assert_eq!(status_for(&AppError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&AppError::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&AppError::UpstreamUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
