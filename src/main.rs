use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use poplink::{config::AppConfig, db, geo::GeoLocator, media::MediaStore, router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (ignore error if file is absent, env vars may already be set)
    dotenvy::dotenv().ok();

    // Initialise structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "poplink=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env()?;
    tracing::info!("Starting poplink on {}:{}", config.host, config.port);
    tracing::info!("Base URL: {}", config.base_url);

    let db = db::connect(&config.database_url, 10)
        .await
        .with_context(|| format!("could not open database {}", config.database_url))?;

    db::migrate(&db).await?;
    tracing::info!("Database migrations applied");

    let media = match &config.s3 {
        Some(s3) => {
            let store = MediaStore::from_config(s3)?;
            tracing::info!("Popup uploads go to bucket {}", s3.bucket);
            Some(store)
        }
        None => {
            tracing::info!("S3_BUCKET not set; popup uploads are disabled");
            None
        }
    };

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(db, config, GeoLocator::new(), media));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
