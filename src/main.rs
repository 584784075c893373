//! Homegate - a homepage redirect gate

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use homegate::{
    api::{self, AppState, HomeRenderer, RedirectStats},
    cache::create_cache,
    config::Config,
    db::{self, repositories::SqlxSettingsRepository},
    services::{RedirectEvaluator, RedirectRateLimiter, SettingsService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; it carries the default log filter
    let config = Config::load_with_env(Path::new("config.yml"))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Homegate {}...", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    pool.ping().await?;
    tracing::info!("Settings store connected: {:?}", pool.driver());

    // Run migrations
    let applied = db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed ({} applied)", applied);

    // Initialize cache
    let cache = create_cache(&config.cache).await?;
    tracing::info!("Cache initialized: {:?}", config.cache.driver);

    // Services
    let settings_service = SettingsService::from_sqlx(SqlxSettingsRepository::new(pool.clone()))
        .with_cache(cache.clone(), Duration::from_secs(config.cache.ttl_seconds));
    let limiter = Arc::new(RedirectRateLimiter::new(cache.clone()));
    let evaluator = RedirectEvaluator::new(limiter, config.gate.home_path.clone());

    if config.admin.token.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("No admin token configured, admin API is disabled");
    }

    // Build application state
    let state = AppState {
        settings_service: Arc::new(settings_service),
        evaluator: Arc::new(evaluator),
        redirect_stats: Arc::new(RedirectStats::new()),
        home: Arc::new(HomeRenderer::new(config.site.name.clone())?),
        gate: Arc::new(config.gate.clone()),
        admin: Arc::new(config.admin.clone()),
    };

    // Build router
    let app = api::build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
