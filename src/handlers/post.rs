//! `POST /post` and `PUT /post` — submit new content.
//!
//! The handler validates and classifies the request, generates a key,
//! pre-populates the loader with an in-flight future, and returns 201
//! immediately; compression and the durable save happen on a background
//! task. A GET arriving right after the 201 joins the in-flight future
//! instead of racing the save.

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use metrics::histogram;
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
use crate::metrics::{
    metrics_label, record_rejected_request, record_request, CONTENT_SIZE_BYTES,
};
use crate::AppState;

pub async fn post_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    // ensure something was actually posted
    if body.is_empty() {
        record_rejected_request(method.as_str(), "missing_content", &headers);
        return Err(HttpError::bad_request("Missing content"));
    }

    // check rate limits
    let rate_limit_result = state.rate_limit_handler.check(
        &headers,
        &addr.ip().to_string(),
        state.post_rate_limiter.as_ref(),
        method.as_str(),
    )?;
    let ip_address = rate_limit_result.ip_address.clone();

    let content_type = header_or(&headers, "content-type", "text/plain");
    let mut encodings = encoding::content_encodings(super::header(&headers, "content-encoding"));
    let user_agent = header_or(&headers, "user-agent", "null");
    let origin = header_or(&headers, "origin", "null");
    let host = header_or(&headers, "host", "null");

    let expiry = state.expiry_handler.expiry(&user_agent, &origin, &host);

    // check max content length. bytes the server will compress itself
    // are judged by their compressed size: compress eagerly when the raw
    // input is over the limit, otherwise defer compression to the save
    // task. already-encoded bodies are checked as received.
    let compress_server_side = encodings.is_empty();
    let mut body = body;
    let mut compressed_early = false;
    if body.len() as u64 > state.max_content_length {
        if compress_server_side {
            body = gzip::compress(&body).await.map_err(anyhow::Error::from)?;
            compressed_early = true;
        }
        if body.len() as u64 > state.max_content_length {
            record_rejected_request(method.as_str(), "content_too_large", &headers);
            return Err(HttpError::content_too_large());
        }
    }
    if compress_server_side {
        encodings.push(encoding::GZIP.to_string());
    }

    // check for our custom Allow-Modification header
    let allow_modifications = super::header(&headers, "allow-modification")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let auth_key = allow_modifications.then(|| state.auth_key_token_generator.generate());

    // generate a key
    let key = state.content_token_generator.generate();

    info!(
        %key,
        %content_type,
        %user_agent,
        ip = %ip_address,
        %origin,
        %host,
        size = body.len(),
        encoding = ?encodings,
        "[post]"
    );

    if rate_limit_result.count_metrics() {
        record_request(method.as_str(), &headers);
        histogram!(CONTENT_SIZE_BYTES, "useragent" => metrics_label(&headers))
            .record(body.len() as f64);

        state.log_sink.log_post(
            &key,
            &request_user(&headers, &ip_address),
            ContentInfo {
                content_length: body.len() as u64,
                content_type: content_type.clone(),
                content_expiry: expiry,
            },
        );
    }

    // record the content in the cache before responding; it's quite
    // likely the content will be requested only seconds after upload
    let (tx, rx) = oneshot::channel::<Content>();
    state.loader.put(
        key.clone(),
        pending_content(async move { rx.await.unwrap_or_else(|_| Content::empty()) }),
    );

    let needs_compression = compress_server_side && !compressed_early;
    let encoding_joined = encodings.join(",");
    let storage = state.storage.clone();
    let save_key = key.clone();
    let save_content_type = content_type.clone();
    let save_auth_key = auth_key.clone();
    tokio::spawn(async move {
        let bytes = if needs_compression {
            match gzip::compress(&body).await {
                Ok(compressed) => compressed,
                Err(err) => {
                    error!("error compressing content '{save_key}': {err}");
                    body
                }
            }
        } else {
            body
        };

        let mut content = Content::new(
            save_key,
            save_content_type,
            expiry,
            now_millis(),
            save_auth_key,
            encoding_joined,
            bytes,
        );
        let _ = tx.send(content.clone());

        let result = storage.save(&mut content).await;
        content.save_signal().complete();
        if let Err(err) = result {
            error!("error saving content '{}': {err:#}", content.key);
        }
    });

    // return the location as plain content
    let mut response = if method == Method::PUT {
        // PUT: return the URL where the content can be accessed
        let host = state.host_aliases.get(&host).cloned().unwrap_or(host);
        let location = format!("https://{host}/{key}");
        (
            StatusCode::CREATED,
            [
                (header::LOCATION, location.clone()),
                (header::CONTENT_TYPE, "text/plain".to_string()),
            ],
            format!("{location}\n"),
        )
            .into_response()
    } else {
        // POST: return the key
        (
            StatusCode::CREATED,
            [
                (header::LOCATION, key.clone()),
                (header::CONTENT_TYPE, "application/json".to_string()),
            ],
            serde_json::json!({ "key": key }).to_string(),
        )
            .into_response()
    };

    if let Some(auth_key) = auth_key {
        if let Ok(value) = auth_key.parse() {
            response.headers_mut().insert("modification-key", value);
        }
    }

    Ok(response)
}
