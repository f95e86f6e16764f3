//! `POST /admin/bulkdelete` — delete many records at once.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::header_or;
use crate::errors::HttpError;
use crate::ratelimit::HEADER_API_KEY;
use crate::AppState;

pub async fn bulk_delete_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let api_key = header_or(&headers, HEADER_API_KEY, "");
    if api_key.is_empty() || !state.admin_api_keys.contains(&api_key) {
        return Err(HttpError::unauthorized("API key is invalid"));
    }

    // body is a JSON array of keys
    let keys: Vec<String> = serde_json::from_slice(&body)
        .map_err(|_| HttpError::bad_request("Missing content"))?;
    if keys.is_empty() {
        return Err(HttpError::bad_request("Missing content"));
    }

    let force = query.get("force").is_some_and(|v| v == "true");

    info!(
        user_agent = %header_or(&headers, "user-agent", "null"),
        origin = %header_or(&headers, "origin", "null"),
        keys = ?keys,
        force,
        "[bulk delete]"
    );

    let deleted = state.storage.bulk_delete(&keys, force).await;
    state.loader.invalidate(&keys).await;
    info!("[bulk delete] successfully deleted {deleted} entries");

    Ok(deleted.to_string().into_response())
}
