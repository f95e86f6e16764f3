//! bytebin -- content-addressed any-bytes storage service.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use bytebin::config::Config;
use bytebin::content::coordinator::StorageCoordinator;
use bytebin::content::housekeeper::Housekeeper;
use bytebin::content::index::ContentIndex;
use bytebin::content::loader;
use bytebin::expiry::ExpiryHandler;
use bytebin::logging::{HttpLogSink, LogSink, StubLogSink};
use bytebin::ratelimit::{ExponentialRateLimiter, FixedWindowRateLimiter, RateLimitHandler};
use bytebin::storage::local::LocalDiskBackend;
use bytebin::storage::s3::S3Backend;
use bytebin::storage::{BackendSelector, StorageBackend};
use bytebin::token::{TokenGenerator, AUTH_KEY_LENGTH};
use bytebin::AppState;

/// Command-line arguments for the bytebin server.
#[derive(Parser, Debug)]
#[command(name = "bytebin", version, about = "Content-addressed any-bytes storage service")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("loading bytebin...");
    let config = Config::load(&cli.config)?;

    // the blocking pool doubles as the storage i/o worker pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.core_pool_size.max(1))
        .thread_name("bytebin-io")
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    bytebin::metrics::init_metrics();
    bytebin::metrics::describe_metrics();

    // storage backends; local disk is always registered
    let local = Arc::new(LocalDiskBackend::new("local", "content")?);
    let mut backends: Vec<Arc<dyn StorageBackend>> = vec![local];
    let mut selector = BackendSelector::Static("local".to_string());

    if config.s3 {
        let s3 = Arc::new(S3Backend::new("s3", config.s3_bucket.clone()).await?);
        info!("s3 backend initialised: bucket={}", config.s3_bucket);
        backends.push(s3);

        if config.s3_size_threshold_kb > 0 {
            selector = BackendSelector::IfSizeGt {
                threshold_bytes: config.s3_size_threshold_kb * 1024,
                backend_id: "s3".to_string(),
                next: Box::new(selector),
            };
        }
        if config.s3_expiry_threshold_mins > 0 {
            selector = BackendSelector::IfExpiryGt {
                threshold_mins: config.s3_expiry_threshold_mins,
                backend_id: "s3".to_string(),
                next: Box::new(selector),
            };
        }
    }

    let index = ContentIndex::initialise("db/bytebin.db", &backends).await?;
    let storage = Arc::new(StorageCoordinator::new(index, backends, selector));

    if config.startup_audit {
        let storage = storage.clone();
        tokio::spawn(async move { storage.audit().await });
    }

    let loader = loader::create(
        storage.clone(),
        config.cache_expiry_minutes,
        config.cache_max_size_mb,
    );

    // request log export, when configured
    let http_log_sink = config
        .logging_http_uri
        .as_deref()
        .filter(|uri| !uri.is_empty())
        .map(HttpLogSink::new);
    let log_sink: Arc<dyn LogSink> = match &http_log_sink {
        Some(sink) => {
            sink.start_flush_task(config.logging_http_flush_period_seconds);
            sink.clone()
        }
        None => Arc::new(StubLogSink),
    };

    let expiry_handler = ExpiryHandler::new(
        config.lifetime_minutes,
        &config.lifetime_minutes_by_user_agent,
    );
    if !expiry_handler.has_expiry_times() {
        info!("no lifetimes configured, content will never expire");
    }

    let state = Arc::new(AppState {
        storage: storage.clone(),
        loader,
        log_sink,
        rate_limit_handler: RateLimitHandler::new(config.api_keys.clone()),
        post_rate_limiter: Arc::new(FixedWindowRateLimiter::new(
            config.post_rate_limit_period_mins,
            config.post_rate_limit,
        )),
        update_rate_limiter: Arc::new(FixedWindowRateLimiter::new(
            config.update_rate_limit_period_mins,
            config.update_rate_limit,
        )),
        read_rate_limiter: Arc::new(FixedWindowRateLimiter::new(
            config.read_rate_limit_period_mins,
            config.read_rate_limit,
        )),
        not_found_rate_limiter: Arc::new(ExponentialRateLimiter::new(
            config.read_failed_rate_limit,
            config.read_failed_rate_limit_period_mins,
            config.read_failed_rate_limit_period_multiplier,
            config.read_failed_rate_limit_period_max_mins,
        )),
        content_token_generator: TokenGenerator::new(config.key_length),
        auth_key_token_generator: TokenGenerator::new(AUTH_KEY_LENGTH),
        max_content_length: config.max_content_length(),
        expiry_handler,
        host_aliases: config.http_host_aliases.clone(),
        admin_api_keys: config.admin_api_keys.iter().cloned().collect(),
    });

    Housekeeper::new(storage, config.housekeeper_period_minutes).start();

    let app = bytebin::server::app(state, config.metrics_enabled);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("bytebin listening on {bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // export anything still queued before exiting
    if let Some(sink) = http_log_sink {
        sink.flush().await;
    }

    info!("bytebin shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
