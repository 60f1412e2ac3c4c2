use std::{net::SocketAddr, sync::Arc};
use axum::{http::HeaderValue, Router};
use tower_http::{cors::{Any, CorsLayer}, compression::CompressionLayer};
use tracing_subscriber::EnvFilter;
use sqlx::postgres::PgPoolOptions;

use car_listings::auth::{AuthService, HybridAuthService};
use car_listings::config::AppConfig;
use car_listings::handlers::{app, AppState};
use car_listings::repository::RepositoryFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,axum=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();

    let cfg = match AppConfig::load() { Ok(c) => c, Err(e) => { eprintln!("Configuration error: {}", e); std::process::exit(1);} };

    // Try to connect to Postgres; fall back to in-memory if unavailable
    let pool = match PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await
    {
        Ok(p) => {
            if let Err(e) = sqlx::migrate!("./migrations").run(&p).await {
                tracing::error!(error = %e, "migrations failed; continuing without database");
                None
            } else {
                Some(p)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Postgres not available; starting with in-memory repositories");
            None
        }
    };

    // Redis only backs the session whitelist; without it tokens cannot be revoked
    let redis_client = match redis::Client::open(cfg.redis.url.clone()) {
        Ok(client) => {
            match client.get_async_connection().await {
                Ok(mut conn) => {
                    let ping_ok = redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok();
                    if ping_ok { Some(client) } else {
                        tracing::warn!("Redis PING failed; continuing without Redis");
                        None
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis connection failed; continuing without Redis");
                    None
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis client init failed; continuing without Redis");
            None
        }
    };

    let repos = match &pool {
        Some(p) => RepositoryFactory::postgres(p.clone()),
        None => RepositoryFactory::in_memory(),
    };

    let auth = Arc::new(HybridAuthService::new(&cfg.jwt.secret, cfg.jwt.expiry_hours, redis_client.clone()).with_cost(cfg.bcrypt_cost)) as Arc<dyn AuthService>;

    let state = AppState::new(repos, auth, cfg.image_workers, pool.clone(), redis_client.clone());

    let router: Router = app(state)
        .layer(CompressionLayer::new())
        .layer(cors_layer(&cfg.server.cors_origins));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    tracing::info!(image_workers = cfg.image_workers, "listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => { tracing::warn!(origin = %o, "ignoring invalid CORS origin"); None }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler"); };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
}
