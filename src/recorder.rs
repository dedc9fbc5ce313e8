use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use woothee::parser::Parser;

use crate::{
    geo::GeoLocator,
    models::{EventType, NewAnalyticsEvent},
    store::LinkStore,
};

/// What is known about a visitor when their visit is recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitInfo {
    pub short_link_id: String,
    pub popup_id: Option<String>,
    pub visitor_id: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Handles of the two writes started by [`ClickRecorder::record`]. The
/// redirect flow drops them; tests await them.
pub struct RecordHandles {
    pub event: JoinHandle<()>,
    pub counter: JoinHandle<()>,
}

/// Best-effort visit tracking.
///
/// Every write runs on its own spawned task so that neither its latency nor
/// its failure can reach the visitor. Failures are logged and dropped; there
/// are no retries.
#[derive(Clone)]
pub struct ClickRecorder {
    store: Arc<dyn LinkStore>,
    geo: GeoLocator,
}

impl ClickRecorder {
    pub fn new(store: Arc<dyn LinkStore>, geo: GeoLocator) -> Self {
        Self { store, geo }
    }

    /// Record a visit: one `click` event plus a counter write of
    /// `observed_clicks + 1`. The two writes are independent and may race
    /// each other and other visits; lost increments are tolerated.
    pub fn record(&self, visit: &VisitInfo, observed_clicks: i64) -> RecordHandles {
        let event = self.track(EventType::Click, visit);

        let store = Arc::clone(&self.store);
        let link_id = visit.short_link_id.clone();
        let clicks = observed_clicks.saturating_add(1);
        let counter = tokio::spawn(async move {
            if let Err(e) = store.update_clicks(&link_id, clicks).await {
                tracing::warn!("Click counter update failed for link {}: {}", link_id, e);
            }
        });

        RecordHandles { event, counter }
    }

    /// Append one analytics event in the background.
    pub fn track(&self, event_type: EventType, visit: &VisitInfo) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let geo = self.geo.clone();
        let visit = visit.clone();

        tokio::spawn(async move {
            let agent = parse_user_agent(visit.user_agent.as_deref());

            let location = match visit.ip_address.as_deref() {
                Some(ip) => geo.lookup(ip).await,
                None => None,
            };
            let (country, city) = location
                .map(|info| (info.country, info.city))
                .unwrap_or_default();

            let event = NewAnalyticsEvent {
                id: Uuid::new_v4().to_string(),
                short_link_id: visit.short_link_id,
                popup_id: visit.popup_id,
                visitor_id: visit.visitor_id,
                referrer: visit.referrer,
                browser: agent.browser,
                device: agent.device,
                os: agent.os,
                country,
                city,
                ip_address: visit.ip_address,
                event_type,
            };

            if let Err(e) = store.insert_event(&event).await {
                tracing::warn!(
                    "Failed to record {} event for link {}: {}",
                    event_type.as_str(),
                    event.short_link_id,
                    e
                );
            }
        })
    }
}

#[derive(Debug, Default, PartialEq)]
struct UserAgent {
    browser: Option<String>,
    os: Option<String>,
    device: Option<String>,
}

/// Browser, OS and device category from a User-Agent header via woothee.
fn parse_user_agent(ua: Option<&str>) -> UserAgent {
    let Some(ua) = ua.filter(|s| !s.is_empty()) else {
        return UserAgent::default();
    };

    let known = |value: &str| {
        if value.is_empty() || value == "UNKNOWN" {
            None
        } else {
            Some(value.to_owned())
        }
    };

    match Parser::new().parse(ua) {
        Some(result) => UserAgent {
            browser: known(result.name),
            os: known(result.os),
            device: known(result.category),
        },
        None => UserAgent::default(),
    }
}
