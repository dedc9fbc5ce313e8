use crate::{auth::AuthUser, error::ApiError, media::MediaError, AppState};
use axum::{
    extract::{Multipart, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// POST /api/uploads
///
/// Multipart form with a single `file` part holding a popup image. Returns
/// `{ "url": "<public url>" }`.
pub async fn upload(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let media = state.media.as_ref().ok_or(ApiError::UploadsDisabled)?;

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .map(str::to_owned)
            .unwrap_or_else(|| "application/octet-stream".into());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("could not read file: {e}")))?;
        file = Some((content_type, bytes));
        break;
    }

    let (content_type, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing 'file' part".into()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("file is empty".into()));
    }

    let url = media
        .upload(&auth.user_id, &bytes, &content_type)
        .await
        .map_err(|e| match e {
            MediaError::UnsupportedType(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Upload(other.to_string()),
        })?;

    Ok(Json(json!({ "url": url })))
}
