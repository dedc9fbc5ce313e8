use crate::{
    content::ResolvedPopupContent,
    error::ResolveError,
    models::{EventType, Popup, Trigger},
    recorder::VisitInfo,
    resolver::ResolvedLink,
    session::{OnShow, SessionTimers, TriggerSession, Visit},
    AppState,
};
use askama::Template;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::{
    cookie::{Cookie, SameSite},
    CookieJar,
};
use std::{net::SocketAddr, sync::Arc};
use uuid::Uuid;

pub const VISITOR_COOKIE: &str = "visitor_id";

// ── Template structs ───────────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "redirect.html")]
struct RedirectTemplate {
    title: String,
    destination_url: String,
    home_url: String,
    overlay: Option<OverlayView>,
}

#[derive(Template)]
#[template(path = "not_found.html")]
struct NotFoundTemplate {
    slug: String,
    home_url: String,
    redirect_secs: u64,
}

/// Everything the page needs to draw the overlay and talk back to its
/// trigger session.
struct OverlayView {
    visit_id: String,
    name: String,
    description: String,
    button_text: String,
    button_url: String,
    profile_image_url: Option<String>,
    image_url: Option<String>,
    video_url: Option<String>,
    popup_type: &'static str,
    position: &'static str,
    template: &'static str,
    trigger: &'static str,
    scroll_percent: u8,
    background_color: String,
    text_color: String,
    width: String,
    height: String,
}

impl OverlayView {
    fn new(visit_id: Uuid, content: &ResolvedPopupContent) -> Self {
        let (trigger, scroll_percent) = match content.trigger {
            Trigger::Delay => ("delay", 0),
            Trigger::Scroll { percent } => ("scroll", percent),
            Trigger::ExitIntent => ("exit", 0),
        };

        Self {
            visit_id: visit_id.to_string(),
            name: content.name.clone(),
            description: content.description.clone(),
            button_text: content.button_text.clone(),
            button_url: content.button_url.clone(),
            profile_image_url: content.profile_image_url.clone(),
            image_url: content.image_url.clone(),
            video_url: content.video_url.clone(),
            popup_type: content.popup_type.as_str(),
            position: content.position.as_str(),
            template: content.template.as_str(),
            trigger,
            scroll_percent,
            background_color: content.styles.background_color.clone(),
            text_color: content.styles.text_color.clone(),
            width: content.styles.width.clone(),
            height: content.styles.height.clone(),
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// GET /
/// Send root visitors to HOME_URL when one is configured.
pub async fn index(State(state): State<Arc<AppState>>) -> Response {
    if state.config.home_url == "/" {
        "poplink".into_response()
    } else {
        Redirect::to(&state.config.home_url).into_response()
    }
}

/// GET /:slug
///
/// 1. Resolve the slug (one store read, link joined with popup).
/// 2. Spawn the click event and counter writes; the page never waits on them.
/// 3. If the link has an active popup the visitor may still see, start a
///    trigger session for this visit.
/// 4. Render the destination in a frame, with the overlay when there is one.
pub async fn visit(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    // ── 1. Resolve ─────────────────────────────────────────────────────────
    let resolved = match state.resolver.resolve(&slug).await {
        Ok(resolved) => resolved,
        Err(e) => {
            match &e {
                ResolveError::NotFound(_) => tracing::info!("{}", e),
                ResolveError::Transport { source, .. } => {
                    tracing::error!("{}: {:?}", e, source)
                }
            }
            return not_found(&state, slug);
        }
    };

    // ── 2. Identify and record ─────────────────────────────────────────────
    let (jar, visitor_id, returning) = visitor_cookie(jar);

    let info = VisitInfo {
        short_link_id: resolved.link.id.clone(),
        popup_id: resolved.link.popup_id.clone(),
        visitor_id: Some(visitor_id.clone()),
        referrer: header_value(&headers, "referer"),
        user_agent: header_value(&headers, "user-agent"),
        ip_address: extract_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
    };

    state.recorder.record(&info, resolved.link.clicks);

    // ── 3. Popup session ───────────────────────────────────────────────────
    let overlay = match overlay_content(&state, &resolved, &visitor_id, returning).await {
        Some(content) => {
            let recorder = state.recorder.clone();
            let view_info = info.clone();
            let on_show: OnShow = Box::new(move || {
                recorder.track(EventType::PopupView, &view_info);
            });

            let timers = SessionTimers::from_config(&state.config);
            let session = TriggerSession::start(content.clone(), timers, Some(on_show));
            let visit_id = state.visits.insert(Visit { session, info });
            Some(OverlayView::new(visit_id, &content))
        }
        None => None,
    };

    // ── 4. Render ──────────────────────────────────────────────────────────
    let link = resolved.link;
    let page = RedirectTemplate {
        title: link.title.clone().unwrap_or_else(|| link.slug.clone()),
        destination_url: link.destination_url,
        home_url: state.config.home_url.clone(),
        overlay,
    };

    (jar, page).into_response()
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn not_found(state: &AppState, slug: String) -> Response {
    let page = NotFoundTemplate {
        slug,
        home_url: state.config.home_url.clone(),
        redirect_secs: state.config.not_found_redirect_secs,
    };
    (StatusCode::NOT_FOUND, page).into_response()
}

/// The overlay for this visit, unless the link has no active popup or the
/// visitor has already seen it `frequency_cap` times.
async fn overlay_content(
    state: &AppState,
    resolved: &ResolvedLink,
    visitor_id: &str,
    returning: bool,
) -> Option<ResolvedPopupContent> {
    let content = resolved.popup_content()?;
    let popup = resolved.popup.as_ref()?;

    if returning && frequency_capped(state, popup, visitor_id).await {
        tracing::debug!("Popup {} capped for visitor {}", popup.id, visitor_id);
        return None;
    }

    Some(content)
}

async fn frequency_capped(state: &AppState, popup: &Popup, visitor_id: &str) -> bool {
    let Some(cap) = popup.frequency_cap.filter(|cap| *cap > 0) else {
        return false;
    };

    match state
        .store
        .count_events(&popup.id, visitor_id, EventType::PopupView)
        .await
    {
        Ok(seen) => seen >= cap,
        Err(e) => {
            tracing::warn!("Frequency cap check failed for popup {}: {}", popup.id, e);
            false
        }
    }
}

/// Read the visitor id cookie, or issue a new one valid for a year.
/// Returns the jar to send back, the id, and whether the visitor is returning.
fn visitor_cookie(jar: CookieJar) -> (CookieJar, String, bool) {
    if let Some(id) = jar
        .get(VISITOR_COOKIE)
        .map(|c| c.value().to_owned())
        .filter(|v| Uuid::parse_str(v).is_ok())
    {
        return (jar, id, true);
    }

    let id = Uuid::new_v4().to_string();
    let cookie = Cookie::build((VISITOR_COOKIE, id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(365))
        .build();

    (jar.add(cookie), id, false)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Determine the real client IP, preferring common proxy headers.
fn extract_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_owned());
            }
        }
    }

    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return Some(real_ip);
    }

    peer.map(|addr| addr.ip().to_string())
}
