//! bytebin — a fast content-addressed "any-bytes" storage service.
//!
//! Clients POST an opaque blob and receive a short random key; a later
//! GET returns the bytes with their original content type and transport
//! encoding. Content carries a configurable lifetime and is garbage
//! collected by a periodic housekeeper. This crate provides the whole
//! content lifecycle engine: the request pipeline, the byte-weighted
//! content cache, rate limiting, the storage-backend abstraction with a
//! write-routing policy, the durable metadata index, and housekeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub mod config;
pub mod content;
pub mod encoding;
pub mod errors;
pub mod expiry;
pub mod gzip;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod ratelimit;
pub mod server;
pub mod storage;
pub mod token;

use crate::content::coordinator::StorageCoordinator;
use crate::content::loader::ContentLoader;
use crate::expiry::ExpiryHandler;
use crate::logging::LogSink;
use crate::ratelimit::{RateLimitHandler, RateLimiter};
use crate::token::TokenGenerator;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Composition of the metadata index and the byte backends.
    pub storage: Arc<StorageCoordinator>,
    /// Content loader, cached or direct.
    pub loader: Arc<dyn ContentLoader>,
    /// Request log-event sink.
    pub log_sink: Arc<dyn LogSink>,

    /// Trusted-proxy aware IP resolution + limit checking.
    pub rate_limit_handler: RateLimitHandler,
    pub post_rate_limiter: Arc<dyn RateLimiter>,
    pub update_rate_limiter: Arc<dyn RateLimiter>,
    pub read_rate_limiter: Arc<dyn RateLimiter>,
    /// Secondary limiter keyed on the same IPs, fed by 404s.
    pub not_found_rate_limiter: Arc<dyn RateLimiter>,

    /// Generates content keys.
    pub content_token_generator: TokenGenerator,
    /// Generates 32-char modification keys.
    pub auth_key_token_generator: TokenGenerator,

    /// Maximum accepted content size in bytes.
    pub max_content_length: u64,
    /// Content lifetime policy.
    pub expiry_handler: ExpiryHandler,
    /// Host aliases applied to PUT-style absolute URLs.
    pub host_aliases: HashMap<String, String>,
    /// API keys accepted on the admin routes.
    pub admin_api_keys: HashSet<String>,
}
