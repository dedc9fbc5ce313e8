//! The persistence port used by the redirect flow.
//!
//! The resolver and the click recorder only see [`LinkStore`], so tests can
//! swap the SQLite pool for [`memory::MemoryStore`].

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{
    db,
    error::StoreError,
    models::{EventType, LinkWithPopup, NewAnalyticsEvent},
};

pub mod memory;

#[async_trait]
pub trait LinkStore: Send + Sync {
    /// The link with `slug` joined with its popup, in one read.
    async fn find_by_slug(&self, slug: &str) -> Result<Option<LinkWithPopup>, StoreError>;

    /// Overwrite the click counter. Callers compute the new value themselves;
    /// there is no concurrency control.
    async fn update_clicks(&self, link_id: &str, clicks: i64) -> Result<(), StoreError>;

    async fn insert_event(&self, event: &NewAnalyticsEvent) -> Result<(), StoreError>;

    /// How many `event_type` events `visitor_id` has produced for a popup.
    async fn count_events(
        &self,
        popup_id: &str,
        visitor_id: &str,
        event_type: EventType,
    ) -> Result<i64, StoreError>;
}

/// [`LinkStore`] over the application's SQLite pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LinkStore for SqliteStore {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<LinkWithPopup>, StoreError> {
        Ok(db::find_link_by_slug(&self.pool, slug).await?)
    }

    async fn update_clicks(&self, link_id: &str, clicks: i64) -> Result<(), StoreError> {
        Ok(db::update_clicks(&self.pool, link_id, clicks).await?)
    }

    async fn insert_event(&self, event: &NewAnalyticsEvent) -> Result<(), StoreError> {
        Ok(db::insert_event(&self.pool, event).await?)
    }

    async fn count_events(
        &self,
        popup_id: &str,
        visitor_id: &str,
        event_type: EventType,
    ) -> Result<i64, StoreError> {
        Ok(db::count_events(&self.pool, popup_id, visitor_id, event_type).await?)
    }
}
