use crate::{
    auth::AuthUser,
    db,
    error::ApiError,
    content::{self, RawContent},
    models::{Popup, PopupStyles, PopupType, Position, ShortLink, TriggerKind},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const SLUG_LEN: usize = 8;
const MAX_SLUG_LEN: usize = 64;

// ── Request / response bodies ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub destination_url: String,
    /// Custom slug; a random one is generated when absent.
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub popup: Option<PopupInput>,
}

/// Popup fields accepted on create and update. On update, absent fields are
/// left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct PopupInput {
    pub name: Option<String>,
    /// Either a JSON object or an already-encoded string.
    pub content: Option<Value>,
    #[serde(rename = "type")]
    pub popup_type: Option<String>,
    pub position: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_value: Option<Value>,
    pub styles: Option<Value>,
    pub active: Option<bool>,
    pub frequency_cap: Option<i64>,
    pub targeting_rules: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    #[serde(flatten)]
    pub link: ShortLink,
    pub short_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup: Option<Popup>,
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// POST /api/links
///
/// Creates the popup (if any) and then the link pointing at it, in one
/// transaction.
pub async fn create_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<LinkResponse>), ApiError> {
    let destination = validate_destination(&req.destination_url)?;

    let slug = match req.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(slug) => {
            validate_slug(slug)?;
            if db::slug_exists(&state.db, slug).await? {
                return Err(ApiError::Conflict(format!("slug '{slug}' is already taken")));
            }
            slug.to_owned()
        }
        None => generate_unique_slug(&state.db).await?,
    };

    let popup = match req.popup {
        Some(input) => {
            // A blank name lets the link title show through at resolution.
            let name = input.name.as_deref().map(str::trim).unwrap_or_default();
            let mut popup = Popup::new(&auth.user_id, name);
            apply_popup_input(&mut popup, input)?;
            Some(popup)
        }
        None => None,
    };

    let mut link = ShortLink::new(&auth.user_id, &slug, &destination);
    link.title = clean(req.title);
    link.description = clean(req.description);
    link.popup_id = popup.as_ref().map(|p| p.id.clone());

    if let Err(e) = db::create_link(&state.db, &link, popup.as_ref()).await {
        // Lost a race with another create for the same slug.
        if e.to_string().contains("UNIQUE") {
            return Err(ApiError::Conflict(format!("slug '{slug}' is already taken")));
        }
        return Err(e.into());
    }

    tracing::info!("Created link {} -> {}", link.slug, link.destination_url);

    let short_url = short_url(&state, &link);
    Ok((
        StatusCode::CREATED,
        Json(LinkResponse {
            link,
            short_url,
            popup,
        }),
    ))
}

/// GET /api/links
pub async fn list_links(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LinkResponse>>, ApiError> {
    let links = db::list_links(&state.db, &auth.user_id).await?;

    let mut out = Vec::with_capacity(links.len());
    for link in links {
        let popup = match &link.popup_id {
            Some(id) => db::get_popup(&state.db, id).await?,
            None => None,
        };
        out.push(LinkResponse {
            short_url: short_url(&state, &link),
            link,
            popup,
        });
    }

    Ok(Json(out))
}

/// PATCH /api/popups/:id
pub async fn update_popup(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<PopupInput>,
) -> Result<Json<Popup>, ApiError> {
    let mut popup = db::get_popup(&state.db, &id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if popup.user_id != auth.user_id {
        return Err(ApiError::Forbidden);
    }

    if let Some(name) = input.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".into()));
        }
        popup.name = name.to_owned();
    }
    apply_popup_input(&mut popup, input)?;

    db::update_popup(&state.db, &popup).await?;
    tracing::info!("Updated popup {}", popup.id);

    // Re-read so the response carries the stored updated_at.
    let popup = db::get_popup(&state.db, &id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(popup))
}

/// DELETE /api/links/:id
///
/// Deletes the link, its popup and its analytics trail.
pub async fn delete_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let link = db::get_link(&state.db, &id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if link.user_id != auth.user_id {
        return Err(ApiError::Forbidden);
    }

    if !db::delete_link(&state.db, &link).await? {
        return Err(ApiError::NotFound);
    }

    tracing::info!("Deleted link {}", link.slug);
    Ok(StatusCode::NO_CONTENT)
}

// ── Private helpers ────────────────────────────────────────────────────────

/// Copy the present fields of `input` onto `popup`, validating enumerations.
/// `name` is handled by the callers, whose rules differ.
fn apply_popup_input(popup: &mut Popup, input: PopupInput) -> Result<(), ApiError> {
    if let Some(content) = input.content {
        if let Some(key) = content::invalid_url_key(RawContent::from_value(content.clone())) {
            return Err(ApiError::BadRequest(format!(
                "content.{key} must be an http(s) URL"
            )));
        }
        popup.content = json_column(content);
    }
    if let Some(kind) = input.popup_type {
        popup.popup_type = PopupType::parse(&kind)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown popup type '{kind}'")))?
            .as_str()
            .to_owned();
    }
    if let Some(position) = input.position {
        let parsed = Position::parse(&position)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown position '{position}'")))?;
        popup.position = Some(parsed.as_str().to_owned());
    }
    if let Some(trigger) = input.trigger_type {
        popup.trigger_type = TriggerKind::parse(&trigger)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown trigger type '{trigger}'")))?
            .as_str()
            .to_owned();
    }
    if let Some(value) = input.trigger_value {
        popup.trigger_value = json_column(value);
    }
    if let Some(styles) = input.styles {
        if !matches!(styles, Value::Object(_) | Value::Null) {
            return Err(ApiError::BadRequest("styles must be an object".into()));
        }
        if !styles.is_null() {
            let parsed: PopupStyles = serde_json::from_value(styles.clone())
                .map_err(|e| ApiError::BadRequest(format!("invalid styles: {e}")))?;
            if let Some(key) = content::invalid_style_key(&parsed) {
                return Err(ApiError::BadRequest(format!(
                    "styles.{key} must be a plain CSS value"
                )));
            }
        }
        popup.styles = json_column(styles);
    }
    if let Some(active) = input.active {
        popup.active = active;
    }
    if let Some(cap) = input.frequency_cap {
        if cap < 0 {
            return Err(ApiError::BadRequest("frequency_cap must not be negative".into()));
        }
        popup.frequency_cap = (cap > 0).then_some(cap);
    }
    if let Some(rules) = input.targeting_rules {
        popup.targeting_rules = json_column(rules);
    }
    Ok(())
}

/// Store a JSON value in a text column. Strings are stored as-is so that
/// already-encoded payloads are not encoded twice; `null` clears the column.
fn json_column(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn short_url(state: &AppState, link: &ShortLink) -> String {
    format!("{}/{}", state.config.base_url, link.slug)
}

/// The destination must be an absolute http(s) URL.
fn validate_destination(raw: &str) -> Result<String, ApiError> {
    let raw = raw.trim();
    let url = reqwest::Url::parse(raw)
        .map_err(|_| ApiError::BadRequest("destination_url must be an absolute URL".into()))?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(raw.to_owned()),
        _ => Err(ApiError::BadRequest(
            "destination_url must start with http:// or https://".into(),
        )),
    }
}

/// Custom slugs: letters, digits, hyphens and underscores.
fn validate_slug(slug: &str) -> Result<(), ApiError> {
    if slug.len() > MAX_SLUG_LEN {
        return Err(ApiError::BadRequest(format!(
            "slug must be at most {MAX_SLUG_LEN} characters"
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::BadRequest(
            "slug may only contain letters, numbers, hyphens and underscores".into(),
        ));
    }
    // These paths belong to the service itself.
    if matches!(slug, "api" | "v" | "health") {
        return Err(ApiError::Conflict(format!("slug '{slug}' is reserved")));
    }
    Ok(())
}

/// Generate a random slug that doesn't already exist in the database. Tries
/// up to 10 times before falling back to a longer one (the UNIQUE constraint
/// in the DB is the real guard).
async fn generate_unique_slug(pool: &sqlx::SqlitePool) -> Result<String, sqlx::Error> {
    generate_unique_slug_with(pool, || random_slug(SLUG_LEN)).await
}

async fn generate_unique_slug_with(
    pool: &sqlx::SqlitePool,
    mut candidate: impl FnMut() -> String,
) -> Result<String, sqlx::Error> {
    for _ in 0..10 {
        let slug = candidate();
        if !db::slug_exists(pool, &slug).await? {
            return Ok(slug);
        }
        tracing::debug!("Slug {} already taken, regenerating", slug);
    }
    Ok(random_slug(SLUG_LEN + 4))
}

/// Generate a random lowercase alphanumeric string of the given length.
fn random_slug(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
