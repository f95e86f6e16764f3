//! Configuration loading for bytebin.
//!
//! Configuration is read from an optional JSON file (camelCase keys)
//! and deserialized into [`Config`]. Every option also has an
//! upper-snake environment variable that overrides the file value, so
//! deployments can be configured without touching the file at all.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
    /// Host → alias map applied when building PUT-style absolute URLs.
    pub http_host_aliases: HashMap<String, String>,

    /// Length of generated content keys.
    pub key_length: usize,
    /// Size of the blocking worker pool used for storage i/o.
    pub core_pool_size: usize,

    /// Whether to expose the `/metrics` endpoint.
    pub metrics_enabled: bool,
    /// Whether to run a backend/index audit at startup.
    pub startup_audit: bool,

    /// URI for the HTTP log sink; unset disables request log export.
    pub logging_http_uri: Option<String>,
    /// Seconds between log sink flushes.
    pub logging_http_flush_period_seconds: u64,

    /// Minutes of access-idle time before cached content is dropped.
    /// Zero disables the cache (direct mode).
    pub cache_expiry_minutes: u64,
    /// Maximum total weight of the content cache, in megabytes.
    pub cache_max_size_mb: u64,

    /// Maximum accepted content size, in megabytes.
    pub max_content_length_mb: u64,
    /// Default content lifetime in minutes; zero or negative means never.
    pub lifetime_minutes: i64,
    /// Lifetime overrides keyed by user agent, origin or host.
    pub lifetime_minutes_by_user_agent: HashMap<String, i64>,
    /// Minutes between housekeeper runs.
    pub housekeeper_period_minutes: u64,

    /// Trusted-proxy API keys (rate limiting on behalf of clients).
    pub api_keys: Vec<String>,
    /// Admin API keys (bulk delete).
    pub admin_api_keys: Vec<String>,

    pub post_rate_limit_period_mins: u64,
    pub post_rate_limit: u32,
    pub update_rate_limit_period_mins: u64,
    pub update_rate_limit: u32,
    pub read_rate_limit_period_mins: u64,
    pub read_rate_limit: u32,

    pub read_failed_rate_limit_period_mins: u64,
    pub read_failed_rate_limit_period_multiplier: f64,
    pub read_failed_rate_limit_period_max_mins: u64,
    pub read_failed_rate_limit: u32,

    /// Whether to register the S3 backend.
    pub s3: bool,
    /// Bucket used by the S3 backend.
    pub s3_bucket: String,
    /// Route content larger than this (KB) to S3; zero disables the rule.
    pub s3_size_threshold_kb: u64,
    /// Route content living longer than this (minutes) to S3; zero
    /// disables the rule.
    pub s3_expiry_threshold_mins: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            http_host_aliases: HashMap::new(),
            key_length: 7,
            core_pool_size: 16,
            metrics_enabled: true,
            startup_audit: false,
            logging_http_uri: None,
            logging_http_flush_period_seconds: 10,
            cache_expiry_minutes: 10,
            cache_max_size_mb: 200,
            max_content_length_mb: 10,
            lifetime_minutes: 60 * 24 * 7,
            lifetime_minutes_by_user_agent: HashMap::new(),
            housekeeper_period_minutes: 5,
            api_keys: Vec::new(),
            admin_api_keys: Vec::new(),
            post_rate_limit_period_mins: 10,
            post_rate_limit: 30,
            update_rate_limit_period_mins: 2,
            update_rate_limit: 26,
            read_rate_limit_period_mins: 2,
            read_rate_limit: 30,
            read_failed_rate_limit_period_mins: 2,
            read_failed_rate_limit_period_multiplier: 2.0,
            read_failed_rate_limit_period_max_mins: 30,
            read_failed_rate_limit: 5,
            s3: false,
            s3_bucket: "bytebin".to_string(),
            s3_size_threshold_kb: 0,
            s3_expiry_threshold_mins: 0,
        }
    }
}

impl Config {
    /// Load configuration from the JSON file at `path` (all defaults
    /// apply when it does not exist), then apply environment-variable
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        let mut config = if path.as_ref().exists() {
            let contents = std::fs::read_to_string(path.as_ref())?;
            serde_json::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_override("BYTEBIN_HTTP_HOST", &mut self.host);
        env_parse("BYTEBIN_HTTP_PORT", &mut self.port);
        env_map_str("BYTEBIN_HTTP_HOSTALIASES", &mut self.http_host_aliases);
        env_parse("BYTEBIN_MISC_KEYLENGTH", &mut self.key_length);
        env_parse("BYTEBIN_MISC_COREPOOLSIZE", &mut self.core_pool_size);
        env_parse("BYTEBIN_METRICS_ENABLED", &mut self.metrics_enabled);
        env_parse("BYTEBIN_STARTUP_AUDIT", &mut self.startup_audit);
        if let Some(uri) = env_var("BYTEBIN_LOGGING_HTTP_URI") {
            self.logging_http_uri = Some(uri);
        }
        env_parse(
            "BYTEBIN_LOGGING_HTTP_FLUSH_PERIOD",
            &mut self.logging_http_flush_period_seconds,
        );
        env_parse("BYTEBIN_CACHE_EXPIRY", &mut self.cache_expiry_minutes);
        env_parse("BYTEBIN_CACHE_MAXSIZE", &mut self.cache_max_size_mb);
        env_parse("BYTEBIN_CONTENT_MAXSIZE", &mut self.max_content_length_mb);
        env_parse("BYTEBIN_CONTENT_EXPIRY", &mut self.lifetime_minutes);
        env_map_parse(
            "BYTEBIN_CONTENT_EXPIRY_USERAGENTS",
            &mut self.lifetime_minutes_by_user_agent,
        );
        env_parse(
            "BYTEBIN_HOUSEKEEPER_PERIOD",
            &mut self.housekeeper_period_minutes,
        );
        env_list("BYTEBIN_RATELIMIT_APIKEYS", &mut self.api_keys);
        env_list("BYTEBIN_ADMIN_APIKEYS", &mut self.admin_api_keys);
        env_parse(
            "BYTEBIN_RATELIMIT_POST_PERIOD",
            &mut self.post_rate_limit_period_mins,
        );
        env_parse("BYTEBIN_RATELIMIT_POST_AMOUNT", &mut self.post_rate_limit);
        env_parse(
            "BYTEBIN_RATELIMIT_UPDATE_PERIOD",
            &mut self.update_rate_limit_period_mins,
        );
        env_parse(
            "BYTEBIN_RATELIMIT_UPDATE_AMOUNT",
            &mut self.update_rate_limit,
        );
        env_parse(
            "BYTEBIN_RATELIMIT_READ_PERIOD",
            &mut self.read_rate_limit_period_mins,
        );
        env_parse("BYTEBIN_RATELIMIT_READ_AMOUNT", &mut self.read_rate_limit);
        env_parse(
            "BYTEBIN_RATELIMIT_READ_NOTFOUND_PERIOD",
            &mut self.read_failed_rate_limit_period_mins,
        );
        env_parse(
            "BYTEBIN_RATELIMIT_READ_NOTFOUND_PERIOD_MULTIPLIER",
            &mut self.read_failed_rate_limit_period_multiplier,
        );
        env_parse(
            "BYTEBIN_RATELIMIT_READ_NOTFOUND_PERIOD_MAX",
            &mut self.read_failed_rate_limit_period_max_mins,
        );
        env_parse(
            "BYTEBIN_RATELIMIT_READ_NOTFOUND_AMOUNT",
            &mut self.read_failed_rate_limit,
        );
        env_parse("BYTEBIN_STORAGE_S3", &mut self.s3);
        env_override("BYTEBIN_STORAGE_S3_BUCKET", &mut self.s3_bucket);
        env_parse(
            "BYTEBIN_STORAGE_S3_SIZE_THRESHOLD",
            &mut self.s3_size_threshold_kb,
        );
        env_parse(
            "BYTEBIN_STORAGE_S3_EXPIRY_THRESHOLD",
            &mut self.s3_expiry_threshold_mins,
        );
    }

    /// The max content length in bytes.
    pub fn max_content_length(&self) -> u64 {
        self.max_content_length_mb * crate::content::MEGABYTE_LENGTH
    }
}

// -- Environment helpers ------------------------------------------------------

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_override(name: &str, target: &mut String) {
    if let Some(value) = env_var(name) {
        *target = value;
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Some(value) = env_var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

/// Parse `k1=v1,k2=v2` pairs.
fn env_map_str(name: &str, target: &mut HashMap<String, String>) {
    if let Some(value) = env_var(name) {
        *target = value
            .split(',')
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
    }
}

fn env_map_parse<T: FromStr>(name: &str, target: &mut HashMap<String, T>) {
    if let Some(value) = env_var(name) {
        *target = value
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.trim().parse().ok()?))
            })
            .collect();
    }
}

fn env_list(name: &str, target: &mut Vec<String>) {
    if let Some(value) = env_var(name) {
        *target = value.split(',').map(|v| v.trim().to_string()).collect();
    }
}
