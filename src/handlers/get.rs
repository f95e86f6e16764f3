//! `GET /{id}` — retrieve content.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{info, warn};

use super::{header_or, request_user};
use crate::content::{now_millis, Content};
use crate::encoding;
use crate::errors::HttpError;
use crate::gzip;
use crate::logging::ContentInfo;
use crate::metrics::{record_rejected_request, record_request};
use crate::token;
use crate::AppState;

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    // get the requested path
    if !token::is_valid_key(&id) {
        record_rejected_request("GET", "invalid_path", &headers);
        return Err(HttpError::not_found("Invalid path"));
    }

    // check rate limits
    let rate_limit_result = state.rate_limit_handler.check(
        &headers,
        &addr.ip().to_string(),
        state.read_rate_limiter.as_ref(),
        "GET",
    )?;
    let ip_address = rate_limit_result.ip_address.clone();

    // get the encodings supported by the requester
    let accepted = encoding::accepted_encodings(super::header(&headers, "accept-encoding"));

    let user_agent = header_or(&headers, "user-agent", "null");
    let origin = header_or(&headers, "origin", "null");
    let host = header_or(&headers, "host", "null");

    info!(key = %id, %user_agent, ip = %ip_address, %origin, %host, "[request]");

    let user = request_user(&headers, &ip_address);
    if rate_limit_result.real_user {
        state.log_sink.log_attempted_get(&id, &user);

        if state.not_found_rate_limiter.check(&ip_address) {
            record_rejected_request("GET", "rate_limited_get_not_found", &headers);
            return Err(HttpError::rate_limit_exceeded());
        }
    }

    // request the content from the loader
    let content: Content = state.loader.get(&id).await;
    if content.is_absent() || content.should_expire(now_millis()) {
        if rate_limit_result.real_user {
            state.not_found_rate_limiter.increment(&ip_address);
        }
        record_rejected_request("GET", "not_found", &headers);
        return Err(HttpError::not_found("Invalid path"));
    }

    if rate_limit_result.real_user {
        record_request("GET", &headers);
        state.log_sink.log_get(
            &id,
            &user,
            ContentInfo {
                content_length: content.content_length,
                content_type: content.content_type.clone(),
                content_expiry: content.expiry,
            },
        );
    }

    let last_modified = httpdate::fmt_http_date(
        UNIX_EPOCH + Duration::from_millis(content.last_modified.max(0) as u64),
    );

    // no-transform stops proxy caches recompressing bytes that are
    // almost always served compressed already; immutable lets them skip
    // revalidation entirely for content that can never change
    let cache_control = if content.modifiable {
        "public, no-cache, proxy-revalidate, no-transform"
    } else {
        "public, max-age=604800, no-transform, immutable"
    };

    let stored = encoding::content_encodings(Some(&content.encoding));

    // requester supports the stored content encoding, serve as-is
    if encoding::accepts_all(&accepted, &stored) {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::LAST_MODIFIED, last_modified.as_str())
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::CONTENT_TYPE, content.content_type.as_str());
        if !content.encoding.is_empty() {
            builder = builder.header(header::CONTENT_ENCODING, content.encoding.as_str());
        }
        return builder
            .body(Body::from(content.content.clone()))
            .map_err(|err| anyhow::Error::from(err).into());
    }

    warn!(
        "request for '{id}' was made with incompatible Accept-Encoding headers: \
         Content-Encoding = {stored:?}, Accept-Encoding = {accepted:?}"
    );

    // stored as plain gzip, uncompress on the server side
    if stored.len() == 1 && stored[0] == encoding::GZIP {
        let uncompressed = gzip::decompress(&content.content)
            .await
            .map_err(|_| HttpError::not_found("Unable to uncompress data"))?;

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::LAST_MODIFIED, last_modified.as_str())
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::CONTENT_TYPE, content.content_type.as_str())
            .body(Body::from(uncompressed))
            .map_err(|err| anyhow::Error::from(err).into());
    }

    // requester doesn't support the content encoding, nothing we can do
    let accept_header = header_or(&headers, "accept-encoding", "");
    Err(HttpError::not_acceptable(format!(
        "Accept-Encoding \"{accept_header}\" does not contain Content-Encoding \"{}\"",
        content.encoding
    )))
}
