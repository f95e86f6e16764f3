//! HTTP request handlers.

pub mod admin;
pub mod get;
pub mod post;
pub mod update;

use axum::http::HeaderMap;

use crate::logging::User;

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn header_or(headers: &HeaderMap, name: &str, default: &str) -> String {
    header(headers, name).unwrap_or(default).to_string()
}

pub(crate) fn request_user(headers: &HeaderMap, ip: &str) -> User {
    User {
        user_agent: header_or(headers, "user-agent", "null"),
        origin: header_or(headers, "origin", "null"),
        host: header_or(headers, "host", "null"),
        ip: ip.to_string(),
    }
}
