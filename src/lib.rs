//! Short links that open their destination under a configurable popup.
//!
//! The library exposes the router and its building blocks so the binary and
//! the integration tests assemble the same application.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{delete, get, patch, post},
    Router,
};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod media;
pub mod models;
pub mod recorder;
pub mod resolver;
pub mod session;
pub mod store;
pub mod trigger;

use config::AppConfig;
use geo::GeoLocator;
use media::MediaStore;
use recorder::ClickRecorder;
use resolver::LinkResolver;
use session::VisitRegistry;
use store::{LinkStore, SqliteStore};

/// Largest accepted popup image upload.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

// ── Shared application state ───────────────────────────────────────────────

pub struct AppState {
    pub db: SqlitePool,
    pub config: AppConfig,
    /// The redirect flow's view of persistence.
    pub store: Arc<dyn LinkStore>,
    pub resolver: LinkResolver,
    pub recorder: ClickRecorder,
    /// Trigger sessions of visits whose page is still open.
    pub visits: VisitRegistry,
    /// `None` when no blob store is configured.
    pub media: Option<MediaStore>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        config: AppConfig,
        geo: GeoLocator,
        media: Option<MediaStore>,
    ) -> Self {
        let store: Arc<dyn LinkStore> = Arc::new(SqliteStore::new(db.clone()));

        Self {
            resolver: LinkResolver::new(Arc::clone(&store)),
            recorder: ClickRecorder::new(Arc::clone(&store), geo),
            store,
            db,
            config,
            visits: VisitRegistry::new(),
            media,
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route(
            "/links",
            get(handlers::links::list_links).post(handlers::links::create_link),
        )
        .route("/links/:id", delete(handlers::links::delete_link))
        .route("/popups/:id", patch(handlers::links::update_popup))
        .route(
            "/uploads",
            post(handlers::uploads::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        );

    let visit_router = Router::new()
        .route("/:visit/events", get(handlers::visits::events))
        .route("/:visit/frame-loaded", post(handlers::visits::frame_loaded))
        .route("/:visit/scroll", post(handlers::visits::scrolled))
        .route("/:visit/exit-intent", post(handlers::visits::exit_intent))
        .route("/:visit/dismiss", post(handlers::visits::dismiss))
        .route("/:visit/click-through", post(handlers::visits::click_through));

    Router::new()
        .route("/", get(handlers::redirect::index))
        .route("/health", get(|| async { StatusCode::OK }))
        // Management API (bearer JWT)
        .nest("/api", api_router)
        // Beacons and state stream of open redirect pages
        .nest("/v", visit_router)
        // Short-link page; static prefixes above take priority
        .route("/:slug", get(handlers::redirect::visit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
