use crate::{
    models::EventType,
    session::{Visit, VisitRegistry},
    trigger::{TriggerEvent, TriggerState},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct ScrollBeacon {
    pub percent: f64,
}

// ── State stream ───────────────────────────────────────────────────────────

/// GET /v/:visit/events
///
/// Streams the visit's trigger state as `state` events, starting with the
/// current one. The stream ends when the machine reaches a terminal state;
/// when it ends, or the page goes away, the visit is torn down.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(visit): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let (id, entry) = find_visit(&state.visits, &visit).ok_or(StatusCode::NOT_FOUND)?;
    let updates = WatchStream::new(entry.session.subscribe());
    drop(entry);

    let guard = VisitGuard {
        visits: state.visits.clone(),
        id,
    };

    let stream = updates.map(move |trigger_state| {
        let _alive = &guard;
        Event::default().event("state").json_data(&trigger_state)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Removes a visit from the registry when the event stream is dropped.
struct VisitGuard {
    visits: VisitRegistry,
    id: Uuid,
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        tracing::debug!("Visit {} stream closed", self.id);
        self.visits.remove(&self.id);
    }
}

// ── Beacons ────────────────────────────────────────────────────────────────

/// POST /v/:visit/frame-loaded
pub async fn frame_loaded(
    State(state): State<Arc<AppState>>,
    Path(visit): Path<String>,
) -> StatusCode {
    forward(&state, &visit, TriggerEvent::FrameLoaded)
}

/// POST /v/:visit/scroll
pub async fn scrolled(
    State(state): State<Arc<AppState>>,
    Path(visit): Path<String>,
    Json(beacon): Json<ScrollBeacon>,
) -> StatusCode {
    let percent = if beacon.percent.is_finite() {
        beacon.percent.clamp(0.0, 100.0).round() as u8
    } else {
        0
    };
    forward(&state, &visit, TriggerEvent::Scrolled { percent })
}

/// POST /v/:visit/exit-intent
pub async fn exit_intent(
    State(state): State<Arc<AppState>>,
    Path(visit): Path<String>,
) -> StatusCode {
    forward(&state, &visit, TriggerEvent::ExitIntent)
}

/// POST /v/:visit/dismiss
pub async fn dismiss(State(state): State<Arc<AppState>>, Path(visit): Path<String>) -> StatusCode {
    close(&state, &visit, TriggerEvent::Dismiss, EventType::PopupDismiss)
}

/// POST /v/:visit/click-through
///
/// The page opens the button URL itself; this only closes the overlay and
/// records the click.
pub async fn click_through(
    State(state): State<Arc<AppState>>,
    Path(visit): Path<String>,
) -> StatusCode {
    close(&state, &visit, TriggerEvent::ClickThrough, EventType::PopupClick)
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn find_visit(visits: &VisitRegistry, raw: &str) -> Option<(Uuid, Arc<Visit>)> {
    let id = Uuid::parse_str(raw).ok()?;
    visits.get(&id).map(|visit| (id, visit))
}

fn forward(state: &AppState, visit: &str, event: TriggerEvent) -> StatusCode {
    match find_visit(&state.visits, visit) {
        Some((_, visit)) => {
            visit.session.send(event);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Forward a closing event, recording it only when the popup was on screen.
fn close(state: &AppState, visit: &str, event: TriggerEvent, event_type: EventType) -> StatusCode {
    let Some((_, visit)) = find_visit(&state.visits, visit) else {
        return StatusCode::NOT_FOUND;
    };

    if visit.session.state() == TriggerState::ShowingPopup && visit.session.send(event) {
        state.recorder.track(event_type, &visit.info);
    }

    StatusCode::NO_CONTENT
}
