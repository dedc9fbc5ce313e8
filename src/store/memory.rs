use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use super::LinkStore;
use crate::{
    error::StoreError,
    models::{EventType, LinkWithPopup, NewAnalyticsEvent, Popup, ShortLink},
};

/// In-memory [`LinkStore`] for tests.
///
/// Reads and writes can be made to fail, and writes can be made to hang
/// forever, to check that the redirect flow never waits on them.
#[derive(Default)]
pub struct MemoryStore {
    links: Mutex<Vec<LinkWithPopup>>,
    events: Mutex<Vec<NewAnalyticsEvent>>,
    click_writes: Mutex<Vec<(String, i64)>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    hang_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link; when `popup` is given the link is pointed at it.
    pub fn insert(&self, mut link: ShortLink, popup: Option<Popup>) {
        link.popup_id = popup.as_ref().map(|p| p.id.clone());
        lock(&self.links).push(LinkWithPopup { link, popup });
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn hang_writes(&self, hang: bool) {
        self.hang_writes.store(hang, Ordering::SeqCst);
    }

    /// Every analytics event accepted so far.
    pub fn events(&self) -> Vec<NewAnalyticsEvent> {
        lock(&self.events).clone()
    }

    /// Every `(link_id, clicks)` counter write accepted so far.
    pub fn click_writes(&self) -> Vec<(String, i64)> {
        lock(&self.click_writes).clone()
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        if self.hang_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

/// A panicking test thread must not hide the data from the assertions.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<LinkWithPopup>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        let links = lock(&self.links);
        Ok(links.iter().find(|l| l.link.slug == slug).cloned())
    }

    async fn update_clicks(&self, link_id: &str, clicks: i64) -> Result<(), StoreError> {
        self.before_write().await?;

        let mut links = lock(&self.links);
        if let Some(entry) = links.iter_mut().find(|l| l.link.id == link_id) {
            entry.link.clicks = clicks;
        }
        drop(links);

        lock(&self.click_writes).push((link_id.to_owned(), clicks));
        Ok(())
    }

    async fn insert_event(&self, event: &NewAnalyticsEvent) -> Result<(), StoreError> {
        self.before_write().await?;
        lock(&self.events).push(event.clone());
        Ok(())
    }

    async fn count_events(
        &self,
        popup_id: &str,
        visitor_id: &str,
        event_type: EventType,
    ) -> Result<i64, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        let events = lock(&self.events);
        Ok(events
            .iter()
            .filter(|e| {
                e.popup_id.as_deref() == Some(popup_id)
                    && e.visitor_id.as_deref() == Some(visitor_id)
                    && e.event_type == event_type
            })
            .count() as i64)
    }
}
