//! `PUT /{id}` — replace the content of a modifiable record.
//!
//! A missing record, a non-modifiable record and a wrong modification
//! key are all answered with the same generic 403, so the endpoint
//! cannot be used to probe for valid keys.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

use super::{header_or, request_user};
use crate::content::loader::pending_content;
use crate::content::{now_millis, Content};
use crate::encoding;
use crate::errors::HttpError;
use crate::gzip;
use crate::logging::ContentInfo;
use crate::metrics::{record_rejected_request, record_request};
use crate::token;
use crate::AppState;

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    // get the requested path
    if !token::is_valid_key(&id) {
        record_rejected_request("PUT", "invalid_path", &headers);
        return Err(HttpError::not_found("Invalid path"));
    }

    // ensure something was actually posted
    if body.is_empty() {
        record_rejected_request("PUT", "missing_content", &headers);
        return Err(HttpError::bad_request("Missing content"));
    }

    // check rate limits
    let rate_limit_result = state.rate_limit_handler.check(
        &headers,
        &addr.ip().to_string(),
        state.update_rate_limiter.as_ref(),
        "PUT",
    )?;
    let ip_address = rate_limit_result.ip_address.clone();

    let auth_header = super::header(&headers, "authorization")
        .ok_or_else(|| HttpError::unauthorized("Authorization header not present"))?;
    let auth_key = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| HttpError::unauthorized("Invalid Authorization scheme"))?;

    let user_agent = header_or(&headers, "user-agent", "null");
    let origin = header_or(&headers, "origin", "null");
    let host = header_or(&headers, "host", "null");

    let old_content = state.loader.get(&id).await;
    if old_content.is_absent() {
        record_rejected_request("PUT", "not_found", &headers);
        // generic response, see the module doc
        return Err(HttpError::forbidden("Incorrect modification key"));
    }

    // the old content exists; check that it is modifiable and that the
    // presented key matches
    if !old_content.modifiable || old_content.auth_key.as_deref() != Some(auth_key) {
        return Err(HttpError::forbidden("Incorrect modification key"));
    }

    // determine the new content type & encoding
    let new_content_type = header_or(&headers, "content-type", &old_content.content_type);
    let mut new_encodings =
        encoding::content_encodings(super::header(&headers, "content-encoding"));

    // compress if necessary
    let mut buf = body;
    if new_encodings.is_empty() {
        buf = gzip::compress(&buf).await.map_err(anyhow::Error::from)?;
        new_encodings.push(encoding::GZIP.to_string());
    }

    // check max content length
    if buf.len() as u64 > state.max_content_length {
        record_rejected_request("PUT", "content_too_large", &headers);
        return Err(HttpError::content_too_large());
    }

    let new_expiry = state.expiry_handler.expiry(&user_agent, &origin, &host);

    info!(
        key = %id,
        new_type = %new_content_type,
        new_encoding = ?new_encodings,
        %user_agent,
        ip = %ip_address,
        %origin,
        %host,
        old_size = old_content.content_length,
        new_size = buf.len(),
        "[put]"
    );

    if rate_limit_result.count_metrics() {
        record_request("PUT", &headers);
        state.log_sink.log_post(
            &id,
            &request_user(&headers, &ip_address),
            ContentInfo {
                content_length: buf.len() as u64,
                content_type: new_content_type.clone(),
                content_expiry: new_expiry,
            },
        );
    }

    // rebuild the record with the new data (and a fresh save signal);
    // the key and the modification key carry over
    let mut content = Content::new(
        id.clone(),
        new_content_type,
        new_expiry,
        now_millis(),
        old_content.auth_key.clone(),
        new_encodings.join(","),
        buf,
    );

    // refresh the loader so readers observe the new bytes, then save
    let (tx, rx) = oneshot::channel::<Content>();
    state.loader.put(
        id.clone(),
        pending_content(async move { rx.await.unwrap_or_else(|_| Content::empty()) }),
    );

    let storage = state.storage.clone();
    tokio::spawn(async move {
        let _ = tx.send(content.clone());
        let result = storage.save(&mut content).await;
        content.save_signal().complete();
        if let Err(err) = result {
            error!("error saving content '{}': {err:#}", content.key);
        }
    });

    Ok(StatusCode::OK.into_response())
}
