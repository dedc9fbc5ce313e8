use std::sync::Arc;

use crate::{
    content::{self, ResolvedPopupContent},
    error::ResolveError,
    models::{Popup, ShortLink},
    store::LinkStore,
};

/// A link that can be visited, with its popup if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub link: ShortLink,
    pub popup: Option<Popup>,
}

impl ResolvedLink {
    /// The overlay to show, if the link has an active popup.
    pub fn popup_content(&self) -> Option<ResolvedPopupContent> {
        self.popup
            .as_ref()
            .filter(|popup| popup.active)
            .map(|popup| content::resolve(popup, &self.link))
    }
}

/// Turns a slug into a [`ResolvedLink`] with one read from the store.
///
/// A miss is final: there are no retries, and a transport failure is
/// reported separately but handled by callers exactly like a missing link.
#[derive(Clone)]
pub struct LinkResolver {
    store: Arc<dyn LinkStore>,
}

impl LinkResolver {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, slug: &str) -> Result<ResolvedLink, ResolveError> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(ResolveError::NotFound(String::new()));
        }

        let found = self
            .store
            .find_by_slug(slug)
            .await
            .map_err(|source| ResolveError::Transport {
                slug: slug.to_owned(),
                source,
            })?;

        match found {
            Some(row) if row.link.active => Ok(ResolvedLink {
                link: row.link,
                popup: row.popup,
            }),
            _ => Err(ResolveError::NotFound(slug.to_owned())),
        }
    }
}
