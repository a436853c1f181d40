use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use quotagate_internal::config::Config;
use quotagate_internal::endpoints::{self, AppState};
use quotagate_internal::quota::{QuotaEngine, QuotaMetrics, StatusProjector};
use quotagate_internal::redis_client::RedisClient;
use quotagate_internal::subscription::{
    CachedSubscriptionOracle, RedisSubscriptionStore, SubscriptionAdmin, SubscriptionOracle,
};
use quotagate_internal::usage::{RedisHistorySink, RedisUsageStore, UsageHistorySink, UsageRecordStore};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the config file at the specified path. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Run with default settings. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,
}

fn fatal(message: impl Display) -> ! {
    tracing::error!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    if args.config_file.is_some() && args.default_config {
        fatal("Cannot specify both `--config-file` and `--default-config`");
    }

    let config = match &args.config_file {
        Some(path) => match Config::load_from_path(path) {
            Ok(config) => config,
            Err(e) => fatal(format!("Failed to load config: {e}")),
        },
        None => {
            if !args.default_config {
                tracing::warn!(
                    "No config file specified, running with default settings. Pass `--config-file path/to/quotagate.toml` or `--default-config` to silence this warning."
                );
            }
            Config::default()
        }
    };

    let quota_config = config.quota.clone();
    let redis = match RedisClient::new(&config.gateway.redis_url).await {
        Ok(client) => Arc::new(client),
        Err(e) => fatal(format!("Failed to connect to Redis: {e}")),
    };

    let metrics = Arc::new(QuotaMetrics::default());
    let store = Arc::new(RedisUsageStore::new(
        Arc::clone(&redis),
        quota_config.period(),
        quota_config.redis_timeout(),
    ));
    let history = Arc::new(RedisHistorySink::new(
        Arc::clone(&redis),
        quota_config.redis_timeout(),
    ));
    let subscriptions = Arc::new(RedisSubscriptionStore::new(
        Arc::clone(&redis),
        quota_config.redis_timeout(),
    ));
    let oracle = Arc::new(CachedSubscriptionOracle::new(
        Arc::clone(&subscriptions) as Arc<dyn SubscriptionOracle>,
        std::time::Duration::from_millis(quota_config.subscription_cache_ttl_ms),
        quota_config.subscription_cache_size,
        Arc::clone(&metrics),
    ));

    let engine = Arc::new(QuotaEngine::new(
        store as Arc<dyn UsageRecordStore>,
        Arc::clone(&oracle) as Arc<dyn SubscriptionOracle>,
        history as Arc<dyn UsageHistorySink>,
        quota_config.clone(),
        metrics,
    ));

    let state = AppState {
        engine,
        projector: StatusProjector::new(quota_config.warning_threshold),
        subscriptions: subscriptions as Arc<dyn SubscriptionAdmin>,
        oracle_cache: Some(oracle),
    };

    let app = endpoints::router(state).layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(config.gateway.bind_address).await {
        Ok(listener) => listener,
        Err(e) => fatal(format!(
            "Failed to bind to {}: {e}",
            config.gateway.bind_address
        )),
    };

    tracing::info!(
        "Quota gateway listening on {} (free tier limit: {}, period: {} days, fail-open: {})",
        config.gateway.bind_address,
        quota_config.free_tier_limit,
        quota_config.period_days,
        quota_config.fail_open,
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        fatal(format!("Server error: {e}"));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
