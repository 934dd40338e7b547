mod config;
mod error;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::Config;
use services::credential_gate::CredentialMode;
use services::openai_adapter;
use services::provider_adapter::AdapterRegistry;
use services::rate_limiter::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use services::store::PgStore;
use state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting Capability Gateway on {}", config.listen_addr);
    if config.credential_mode == CredentialMode::Plain {
        tracing::warn!("CREDENTIAL_MODE=plain: client secrets are stored and compared unhashed");
    }

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations applied");

    // Rate counters: shared through Redis when configured, otherwise per process
    let rate: Arc<dyn RateLimiter> = match &config.redis_url {
        Some(url) => {
            let redis = redis::Client::open(url.as_str())?
                .get_connection_manager()
                .await?;
            tracing::info!("Connected to Redis, rate limits are shared");
            Arc::new(RedisRateLimiter::new(redis))
        }
        None => {
            let limiter = Arc::new(MemoryRateLimiter::new());
            let sweeper = limiter.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    let removed = sweeper.sweep();
                    if removed > 0 {
                        tracing::debug!("Swept {} idle rate windows", removed);
                    }
                }
            });
            tracing::info!("REDIS_URL not set, using in-process rate limiting");
            limiter
        }
    };

    let mut adapters = AdapterRegistry::new();
    openai_adapter::register_all(&mut adapters, &reqwest::Client::new());
    tracing::info!("Provider adapters: {}", adapters.providers().join(", "));

    let store = Arc::new(PgStore::new(db.clone()));
    let state = Arc::new(
        AppState::build(config.clone(), db, store.clone(), store, rate, adapters).await?,
    );
    state
        .config_store
        .clone()
        .spawn_refresh_task(config.config_refresh);

    if config.usage_retention_days > 0 {
        let retention_db = state.db.clone();
        let retention_days = config.usage_retention_days;
        tokio::spawn(async move {
            // Run cleanup once on startup, then every hour
            loop {
                match services::usage_service::cleanup_old_usage(&retention_db, retention_days)
                    .await
                {
                    Ok(n) if n > 0 => {
                        tracing::info!(
                            "Cleaned up {} usage records older than {} days",
                            n,
                            retention_days
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Usage cleanup error: {}", e);
                    }
                }
                tokio::time::sleep(MAINTENANCE_INTERVAL).await;
            }
        });
    }

    let allow_origin = if config.cors_origin == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static(middleware::auth::API_KEY_HEADER),
            axum::http::HeaderName::from_static(middleware::auth::API_SECRET_HEADER),
            axum::http::HeaderName::from_static("x-request-id"),
        ]);

    let app = routes::app(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
