mod config;
mod crypto;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod storage;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request},
    middleware::{self as axum_middleware, Next},
    response::Response,
    routing::{delete, get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::middleware::rate_limit::RateLimitState;
use crate::storage::{BlobStore, LocalBlobStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub store: Arc<dyn BlobStore>,
    pub rate_limit: RateLimitState,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strongbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    tracing::info!("Starting StrongBox...");

    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&config.storage.upload_path));
    services::gc::spawn_sweeper(db.clone(), store.clone());

    let rate_limit = RateLimitState::new(
        config.rate_limit.window_ms,
        config.rate_limit.max_requests,
    );

    let state = AppState {
        db,
        config: config.clone(),
        store,
        rate_limit,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Request logging with client IP
async fn logging_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {} {:?}",
        addr.ip(),
        method,
        uri.path(),
        status.as_u16(),
        duration
    );

    response
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Uploads carry up to a full batch of encrypted-size payloads.
    let body_limit = state.config.storage.max_file_size as usize
        * state.config.storage.max_batch_files
        + 1024 * 1024;

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/files/shared/:token", get(handlers::share::shared_download));

    // Protected routes (bearer JWT required)
    let protected_routes = Router::new()
        // Account
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/me", get(handlers::user::me))
        .route("/auth/update-profile", patch(handlers::user::update_profile))
        .route("/auth/update-password", patch(handlers::user::update_password))
        .route("/auth/delete-account", delete(handlers::user::delete_account))
        .route("/auth/storage", get(handlers::user::storage))
        // Files
        .route("/files", get(handlers::file::list))
        .route("/files/upload", post(handlers::file::upload))
        .route(
            "/files/trash",
            get(handlers::file::list_trash).delete(handlers::file::empty_trash),
        )
        .route("/files/bulk-delete", post(handlers::file::bulk_delete))
        .route("/files/move", post(handlers::file::move_files))
        .route("/files/folders", get(handlers::file::folders))
        .route("/files/stats", get(handlers::file::stats))
        .route(
            "/files/:id",
            get(handlers::file::get)
                .patch(handlers::file::update)
                .delete(handlers::file::delete),
        )
        .route("/files/:id/download", get(handlers::file::download))
        .route("/files/:id/preview", get(handlers::file::preview))
        .route("/files/:id/restore", post(handlers::file::restore))
        .route(
            "/files/:id/share",
            post(handlers::share::create_share).delete(handlers::share::revoke_share),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .nest("/api", public_routes.merge(protected_routes))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}
