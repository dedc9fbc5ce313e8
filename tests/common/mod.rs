//! Shared setup for the integration tests: an in-memory database with the
//! migrations applied, and the full router on top of it.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use poplink::{
    auth::Claims,
    config::AppConfig,
    db,
    geo::GeoLocator,
    models::{Popup, ShortLink},
    router, AppState,
};
use std::sync::Arc;
use tower::ServiceExt;

pub const SECRET: &str = "test-secret";

/// Poll `$cond` until it holds, giving background writes about two seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..200 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        held
    }};
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub app: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        let pool = db::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to open test database");
        db::migrate(&pool).await.expect("Failed to run migrations");

        let state = Arc::new(AppState::new(
            pool,
            AppConfig::for_tests(SECRET),
            GeoLocator::disabled(),
            None,
        ));
        let app = router(Arc::clone(&state));

        Self { state, app }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Insert a link (and its popup) the way the management API would.
    pub async fn seed(&self, mut link: ShortLink, popup: Option<Popup>) -> ShortLink {
        link.popup_id = popup.as_ref().map(|p| p.id.clone());
        db::create_link(&self.state.db, &link, popup.as_ref())
            .await
            .expect("Failed to seed link");
        link
    }
}

pub fn token_for(user_id: &str) -> String {
    let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
    encode(
        &Header::default(),
        &Claims {
            sub: user_id.into(),
            exp,
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("Failed to sign test token")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("body is not UTF-8")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let text = body_text(response).await;
    serde_json::from_str(&text).expect("Failed to parse JSON")
}

/// The visit id the redirect page embeds in `data-visit`, if any.
pub fn visit_id(page: &str) -> Option<String> {
    let start = page.find("data-visit=\"")? + "data-visit=\"".len();
    let end = page[start..].find('"')? + start;
    Some(page[start..end].to_owned())
}
