use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A short link record from the `short_links` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct ShortLink {
    pub id: String,
    pub user_id: String,
    pub popup_id: Option<String>,
    pub slug: String,
    pub destination_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub clicks: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
}

impl ShortLink {
    /// A fresh, active link with no clicks and a new id.
    pub fn new(user_id: &str, slug: &str, destination_url: &str) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            popup_id: None,
            slug: slug.to_owned(),
            destination_url: destination_url.to_owned(),
            title: None,
            description: None,
            active: true,
            clicks: 0,
            created_at: now,
            updated_at: now,
            og_title: None,
            og_description: None,
            og_image: None,
        }
    }
}

/// A popup record from the `popups` table.
///
/// The enum-like columns (`type`, `position`, `trigger_type`) are kept as text
/// and read through accessors so rows written by older forms never fail to
/// load. `content`, `trigger_value`, `styles` and `targeting_rules` hold JSON
/// text whose shape has drifted over time; only [`crate::content`] looks
/// inside `content`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct Popup {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub content: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub popup_type: String,
    pub position: Option<String>,
    pub trigger_type: String,
    pub trigger_value: Option<String>,
    pub styles: Option<String>,
    pub active: bool,
    pub frequency_cap: Option<i64>,
    pub targeting_rules: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Popup {
    pub fn new(user_id: &str, name: &str) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            name: name.to_owned(),
            content: None,
            popup_type: PopupType::Text.as_str().to_owned(),
            position: Some(Position::Top.as_str().to_owned()),
            trigger_type: TriggerKind::Delay.as_str().to_owned(),
            trigger_value: None,
            styles: None,
            active: true,
            frequency_cap: None,
            targeting_rules: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> PopupType {
        PopupType::parse(&self.popup_type).unwrap_or_default()
    }

    pub fn position(&self) -> Position {
        self.position
            .as_deref()
            .and_then(Position::parse)
            .unwrap_or_default()
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        TriggerKind::parse(&self.trigger_type).unwrap_or_default()
    }
}

/// A short link together with the popup it points at, as returned by the
/// slug lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkWithPopup {
    pub link: ShortLink,
    pub popup: Option<Popup>,
}

// ── Popup attributes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupType {
    #[default]
    Text,
    Image,
    Video,
}

impl PopupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopupType::Text => "text",
            PopupType::Image => "image",
            PopupType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(PopupType::Text),
            "image" => Some(PopupType::Image),
            "video" => Some(PopupType::Video),
            _ => None,
        }
    }
}

/// Where the overlay sits on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Top,
    Left,
    Right,
    Center,
    Bottom,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Top => "top",
            Position::Left => "left",
            Position::Right => "right",
            Position::Center => "center",
            Position::Bottom => "bottom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "top" => Some(Position::Top),
            "left" => Some(Position::Left),
            "right" => Some(Position::Right),
            "center" => Some(Position::Center),
            "bottom" => Some(Position::Bottom),
            _ => None,
        }
    }
}

/// The stored `trigger_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerKind {
    #[default]
    Delay,
    Scroll,
    ExitIntent,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Delay => "delay",
            TriggerKind::Scroll => "scroll",
            TriggerKind::ExitIntent => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "delay" => Some(TriggerKind::Delay),
            "scroll" => Some(TriggerKind::Scroll),
            "exit" | "exit_intent" | "exit-intent" => Some(TriggerKind::ExitIntent),
            _ => None,
        }
    }
}

/// A trigger with its parameter resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Show after `delay_seconds` of visible content.
    Delay,
    /// Show once the visitor has scrolled `percent` of the page.
    Scroll { percent: u8 },
    /// Show when the pointer leaves the window.
    ExitIntent,
}

/// Visual overrides stored in `popups.styles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PopupStyles {
    pub background_color: String,
    pub text_color: String,
    pub width: String,
    pub height: String,
}

impl Default for PopupStyles {
    fn default() -> Self {
        Self {
            background_color: "#ffffff".into(),
            text_color: "#000000".into(),
            width: "400px".into(),
            height: "auto".into(),
        }
    }
}

// ── Analytics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Click,
    PopupView,
    PopupClick,
    PopupDismiss,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Click => "click",
            EventType::PopupView => "popup_view",
            EventType::PopupClick => "popup_click",
            EventType::PopupDismiss => "popup_dismiss",
        }
    }
}

/// A row to append to the `analytics` table. Rows are never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnalyticsEvent {
    pub id: String,
    pub short_link_id: String,
    pub popup_id: Option<String>,
    pub visitor_id: Option<String>,
    pub referrer: Option<String>,
    pub browser: Option<String>,
    pub device: Option<String>,
    pub os: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub ip_address: Option<String>,
    pub event_type: EventType,
}
