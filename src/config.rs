use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. "sqlite:./poplink.db"
    pub database_url: String,

    /// Host to bind the HTTP server to, e.g. "0.0.0.0"
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Public base URL used when building short URLs, e.g. "https://go.example.com".
    /// Must NOT have a trailing slash.
    pub base_url: String,

    /// Where visitors are sent after a failed resolution, and from "/".
    pub home_url: String,

    /// Seconds the not-found page waits before navigating home.
    pub not_found_redirect_secs: u64,

    /// How long a visit may stay in `Loading` before it is abandoned.
    pub loading_grace: Duration,

    /// How long an armed or open popup may go without page activity before
    /// its visit is closed.
    pub visit_idle: Duration,

    /// HS256 secret used to verify management API bearer tokens.
    pub jwt_secret: String,

    /// Blob store for popup images. Uploads are disabled when absent.
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services (R2, MinIO, ...).
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Public prefix for uploaded objects. Defaults to the bucket URL.
    pub public_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables (populated by dotenvy before this is called).
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .context("JWT_SECRET must be set in the environment or .env file")?;

        if jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse::<u16>()
            .context("PORT must be a valid port number (1–65535)")?;

        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_owned();

        let not_found_redirect_secs = std::env::var("NOT_FOUND_REDIRECT_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>()
                    .context("NOT_FOUND_REDIRECT_SECS must be a whole number of seconds")
            })
            .transpose()?
            .unwrap_or(3);

        let loading_grace_secs = std::env::var("LOADING_GRACE_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>()
                    .context("LOADING_GRACE_SECS must be a whole number of seconds")
            })
            .transpose()?
            .unwrap_or(20);

        let visit_idle_secs = std::env::var("VISIT_IDLE_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>()
                    .context("VISIT_IDLE_SECS must be a whole number of seconds")
            })
            .transpose()?
            .unwrap_or(1800);

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./poplink.db".into()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            base_url,
            home_url: non_empty_var("HOME_URL").unwrap_or_else(|| "/".into()),
            not_found_redirect_secs,
            loading_grace: Duration::from_secs(loading_grace_secs),
            visit_idle: Duration::from_secs(visit_idle_secs),
            jwt_secret,
            s3: S3Config::from_env()?,
        })
    }

    /// Settings for tests and embedding: no blob store, short timers.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            host: "127.0.0.1".into(),
            port: 0,
            base_url: "http://localhost".into(),
            home_url: "/".into(),
            not_found_redirect_secs: 3,
            loading_grace: Duration::from_secs(20),
            visit_idle: Duration::from_secs(1800),
            jwt_secret: jwt_secret.to_owned(),
            s3: None,
        }
    }
}

impl S3Config {
    fn from_env() -> Result<Option<Self>> {
        let Some(bucket) = non_empty_var("S3_BUCKET") else {
            return Ok(None);
        };

        let endpoint = non_empty_var("S3_ENDPOINT");
        let region = match non_empty_var("S3_REGION") {
            Some(region) => region,
            None if endpoint.is_some() => "auto".into(),
            None => anyhow::bail!("S3_REGION must be set when S3_BUCKET is set"),
        };

        Ok(Some(Self {
            bucket,
            region,
            endpoint,
            access_key: non_empty_var("S3_ACCESS_KEY"),
            secret_key: non_empty_var("S3_SECRET_KEY"),
            public_url: non_empty_var("S3_PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_owned()),
        }))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
