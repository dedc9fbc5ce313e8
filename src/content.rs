//! Popup content resolution.
//!
//! Popup `content` has been written by several generations of the editor:
//! sometimes as a JSON object, sometimes as a JSON string that itself holds
//! JSON, with flat CTA keys (`buttonText`) or the newer nested naming
//! (`button_text`, `profile_name`). Everything downstream works with
//! [`ResolvedPopupContent`]; the raw shapes are only inspected here.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{
    Popup, PopupStyles, PopupType, Position, ShortLink, Trigger, TriggerKind,
};

pub const DEFAULT_NAME: &str = "Popup";
pub const DEFAULT_DESCRIPTION: &str = "Check out this content";
pub const DEFAULT_BUTTON_TEXT: &str = "Learn More";
pub const DEFAULT_DELAY_SECONDS: u32 = 3;
pub const DEFAULT_SCROLL_PERCENT: u8 = 50;

const NAME_KEYS: &[&str] = &["name", "ctaName", "profile_name", "title"];
const DESCRIPTION_KEYS: &[&str] = &["description", "ctaDescription", "message"];
const BUTTON_TEXT_KEYS: &[&str] = &["button_text", "buttonText"];
const BUTTON_LINK_KEYS: &[&str] = &["button_link", "buttonLink", "buttonUrl", "button_url"];
const PROFILE_IMAGE_KEYS: &[&str] = &[
    "profile_image",
    "profileImage",
    "profile_image_url",
    "ctaProfileUrl",
];
const IMAGE_KEYS: &[&str] = &["image_url", "imageUrl", "image", "logoUrl"];
const VIDEO_KEYS: &[&str] = &["video_url", "videoUrl"];
const DELAY_KEYS: &[&str] = &["delay_seconds", "delay"];

/// Layout variant chosen in the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Standard,
    Newsletter,
    Promotion,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Standard => "standard",
            TemplateKind::Newsletter => "newsletter",
            TemplateKind::Promotion => "promotion",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Some(TemplateKind::Standard),
            "newsletter" => Some(TemplateKind::Newsletter),
            "promotion" => Some(TemplateKind::Promotion),
            _ => None,
        }
    }
}

/// The stored shape of a popup's `content` before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawContent {
    Absent,
    /// Text expected to hold a JSON object.
    Encoded(String),
    Structured(Map<String, Value>),
}

impl RawContent {
    /// Classify the text of the `content` column.
    ///
    /// Object text is `Structured`; a JSON string literal (double-encoded
    /// content) and anything unparseable are `Encoded`.
    pub fn from_column(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            None | Some("") => RawContent::Absent,
            Some(s) => match serde_json::from_str::<Value>(s) {
                Ok(value) => RawContent::from_value(value),
                Err(_) => RawContent::Encoded(s.to_owned()),
            },
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => RawContent::Absent,
            Value::String(s) => RawContent::Encoded(s),
            Value::Object(map) => RawContent::Structured(map),
            other => RawContent::Encoded(other.to_string()),
        }
    }

    /// The structured payload, or an empty one when there is none. Parse
    /// failures are logged and absorbed.
    fn into_payload(self) -> Map<String, Value> {
        match self {
            RawContent::Absent => Map::new(),
            RawContent::Structured(map) => map,
            RawContent::Encoded(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    tracing::warn!("Popup content is JSON but not an object; using defaults");
                    Map::new()
                }
                Err(e) => {
                    tracing::warn!("Malformed popup content ({}); using defaults", e);
                    Map::new()
                }
            },
        }
    }
}

/// Fully-defaulted popup view model.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPopupContent {
    pub name: String,
    pub description: String,
    pub button_text: String,
    pub button_url: String,
    pub profile_image_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub delay_seconds: u32,
    pub template: TemplateKind,
    pub popup_type: PopupType,
    pub position: Position,
    pub trigger: Trigger,
    pub styles: PopupStyles,
}

/// Resolve a popup attached to `link`.
pub fn resolve(popup: &Popup, link: &ShortLink) -> ResolvedPopupContent {
    resolve_raw(RawContent::from_column(popup.content.as_deref()), popup, link)
}

/// Resolve an already classified payload. `popup` and `link` supply the
/// fallbacks and the non-content popup attributes.
pub fn resolve_raw(raw: RawContent, popup: &Popup, link: &ShortLink) -> ResolvedPopupContent {
    let payload = raw.into_payload();

    let name = pick(&payload, NAME_KEYS)
        .or_else(|| non_empty(Some(popup.name.as_str())))
        .or_else(|| non_empty(link.title.as_deref()))
        .unwrap_or_else(|| DEFAULT_NAME.to_owned());

    let description = pick(&payload, DESCRIPTION_KEYS)
        .or_else(|| non_empty(link.description.as_deref()))
        .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_owned());

    let button_text =
        pick(&payload, BUTTON_TEXT_KEYS).unwrap_or_else(|| DEFAULT_BUTTON_TEXT.to_owned());

    let button_url =
        pick_url(&payload, BUTTON_LINK_KEYS).unwrap_or_else(|| link.destination_url.clone());

    let template = pick(&payload, &["template"])
        .and_then(|t| TemplateKind::parse(&t))
        .unwrap_or_default();

    let trigger = match popup.trigger_kind() {
        TriggerKind::Delay => Trigger::Delay,
        TriggerKind::Scroll => Trigger::Scroll {
            percent: popup
                .trigger_value
                .as_deref()
                .and_then(number_from_column)
                .map(|p| p.clamp(0, 100) as u8)
                .unwrap_or(DEFAULT_SCROLL_PERCENT),
        },
        TriggerKind::ExitIntent => Trigger::ExitIntent,
    };

    ResolvedPopupContent {
        name,
        description,
        button_text,
        button_url,
        profile_image_url: pick_url(&payload, PROFILE_IMAGE_KEYS),
        image_url: pick_url(&payload, IMAGE_KEYS),
        video_url: pick_url(&payload, VIDEO_KEYS),
        delay_seconds: resolve_delay(&payload, popup),
        template,
        popup_type: popup.kind(),
        position: popup.position(),
        trigger,
        styles: parse_styles(popup.styles.as_deref()),
    }
}

/// Payload delay, then the popup's delay trigger value, then the default.
/// Negative values clamp to zero.
fn resolve_delay(payload: &Map<String, Value>, popup: &Popup) -> u32 {
    let from_payload = DELAY_KEYS
        .iter()
        .find_map(|key| payload.get(*key).and_then(number_from_value));

    let from_trigger = || match popup.trigger_kind() {
        TriggerKind::Delay => popup.trigger_value.as_deref().and_then(number_from_column),
        _ => None,
    };

    from_payload
        .or_else(from_trigger)
        .map(|secs| secs.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(DEFAULT_DELAY_SECONDS)
}

fn parse_styles(text: Option<&str>) -> PopupStyles {
    let Some(text) = text.map(str::trim).filter(|s| !s.is_empty()) else {
        return PopupStyles::default();
    };
    let styles: PopupStyles = serde_json::from_str(text).unwrap_or_else(|e| {
        tracing::warn!("Ignoring malformed popup styles: {}", e);
        PopupStyles::default()
    });

    let defaults = PopupStyles::default();
    let keep = |value: String, default: String| {
        if is_css_value(&value) {
            value
        } else {
            tracing::warn!("Ignoring unsafe popup style value {:?}", value);
            default
        }
    };
    PopupStyles {
        background_color: keep(styles.background_color, defaults.background_color),
        text_color: keep(styles.text_color, defaults.text_color),
        width: keep(styles.width, defaults.width),
        height: keep(styles.height, defaults.height),
    }
}

// ── Untrusted values rendered into the page ────────────────────────────────

/// An absolute http(s) URL. Anything else (`javascript:`, `data:`, relative
/// paths) must not reach an `href` or `src`.
pub fn is_web_url(s: &str) -> bool {
    reqwest::Url::parse(s.trim())
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

/// A single CSS value such as `#fff`, `rgb(0, 0, 0)`, `400px` or `auto`.
/// Rejects anything that could end the declaration or open a new one.
pub fn is_css_value(s: &str) -> bool {
    !s.trim().is_empty()
        && s.len() <= 64
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '#' | '%' | '.' | ',' | '(' | ')' | ' ' | '-')
        })
}

/// The first URL key of a content payload whose value is not a web URL.
pub fn invalid_url_key(raw: RawContent) -> Option<&'static str> {
    let payload = raw.into_payload();
    [BUTTON_LINK_KEYS, PROFILE_IMAGE_KEYS, IMAGE_KEYS, VIDEO_KEYS]
        .into_iter()
        .flatten()
        .copied()
        .find(|key| {
            non_empty(payload.get(*key).and_then(Value::as_str)).is_some_and(|url| !is_web_url(&url))
        })
}

/// The first style field whose value is not a plain CSS value.
pub fn invalid_style_key(styles: &PopupStyles) -> Option<&'static str> {
    [
        ("backgroundColor", &styles.background_color),
        ("textColor", &styles.text_color),
        ("width", &styles.width),
        ("height", &styles.height),
    ]
    .into_iter()
    .find(|(_, value)| !is_css_value(value))
    .map(|(key, _)| key)
}

/// First key in `keys` whose value is a non-empty string.
fn pick(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| non_empty(payload.get(*key).and_then(Value::as_str)))
}

/// Like [`pick`], skipping values that are not web URLs.
fn pick_url(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        non_empty(payload.get(*key).and_then(Value::as_str)).filter(|url| {
            let ok = is_web_url(url);
            if !ok {
                tracing::warn!("Ignoring non-http popup URL under '{}'", key);
            }
            ok
        })
    })
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

fn number_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => number_from_str(s),
        _ => None,
    }
}

/// `trigger_value` is JSON text, but older rows hold a bare number.
fn number_from_column(text: &str) -> Option<i64> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => number_from_value(&value),
        Err(_) => number_from_str(text),
    }
}

fn number_from_str(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link() -> ShortLink {
        ShortLink::new("user-1", "abc123", "https://example.com")
    }

    fn popup(content: Option<&str>) -> Popup {
        let mut popup = Popup::new("user-1", "");
        popup.content = content.map(str::to_owned);
        popup
    }

    #[test]
    fn payload_keys_win_when_present() {
        let p = popup(Some(
            r#"{"name":"Ada","description":"Talks","button_text":"Buy Now","button_link":"https://shop.example"}"#,
        ));
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.name, "Ada");
        assert_eq!(resolved.description, "Talks");
        assert_eq!(resolved.button_text, "Buy Now");
        assert_eq!(resolved.button_url, "https://shop.example");
    }

    #[test]
    fn scenario_button_text_and_delay() {
        let p = popup(Some(r#"{"button_text":"Buy Now","delay_seconds":3}"#));
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.button_text, "Buy Now");
        assert_eq!(resolved.delay_seconds, 3);
        assert_eq!(resolved.description, DEFAULT_DESCRIPTION);
        assert_eq!(resolved.name, DEFAULT_NAME);
        assert_eq!(resolved.button_url, "https://example.com");
    }

    #[test]
    fn malformed_content_uses_every_fallback() {
        let resolved = resolve(&popup(Some("not json")), &link());

        assert_eq!(resolved.name, DEFAULT_NAME);
        assert_eq!(resolved.description, DEFAULT_DESCRIPTION);
        assert_eq!(resolved.button_text, DEFAULT_BUTTON_TEXT);
        assert_eq!(resolved.button_url, "https://example.com");
        assert_eq!(resolved.delay_seconds, DEFAULT_DELAY_SECONDS);
        assert_eq!(resolved.template, TemplateKind::Standard);
        assert!(resolved.image_url.is_none());
    }

    #[test]
    fn fallbacks_follow_popup_then_link() {
        let mut l = link();
        l.title = Some("Link title".into());
        l.description = Some("Link description".into());

        let mut p = popup(None);
        let resolved = resolve(&p, &l);
        assert_eq!(resolved.name, "Link title");
        assert_eq!(resolved.description, "Link description");

        p.name = "Popup name".into();
        assert_eq!(resolve(&p, &l).name, "Popup name");
    }

    #[test]
    fn legacy_flat_keys_are_understood() {
        let p = popup(Some(
            r#"{"ctaName":"Grace","ctaDescription":"Compilers","buttonText":"Read","buttonUrl":"https://read.example","ctaProfileUrl":"https://img.example/me.png","logoUrl":"https://img.example/logo.png"}"#,
        ));
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.name, "Grace");
        assert_eq!(resolved.description, "Compilers");
        assert_eq!(resolved.button_text, "Read");
        assert_eq!(resolved.button_url, "https://read.example");
        assert_eq!(
            resolved.profile_image_url.as_deref(),
            Some("https://img.example/me.png")
        );
        assert_eq!(
            resolved.image_url.as_deref(),
            Some("https://img.example/logo.png")
        );
    }

    #[test]
    fn nested_naming_is_understood() {
        let p = popup(Some(
            r#"{"profile_name":"Lin","button_text":"Join","button_link":"https://join.example","template":"newsletter"}"#,
        ));
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.name, "Lin");
        assert_eq!(resolved.button_url, "https://join.example");
        assert_eq!(resolved.template, TemplateKind::Newsletter);
    }

    #[test]
    fn double_encoded_content_is_unwrapped() {
        let inner = json!({ "button_text": "Go" }).to_string();
        let column = serde_json::to_string(&inner).unwrap();
        let resolved = resolve(&popup(Some(&column)), &link());
        assert_eq!(resolved.button_text, "Go");
    }

    #[test]
    fn native_map_and_encoded_string_agree() {
        let value = json!({ "name": "Same", "delay_seconds": "5" });
        let p = popup(None);
        let from_map = resolve_raw(RawContent::from_value(value.clone()), &p, &link());
        let from_text = resolve_raw(RawContent::Encoded(value.to_string()), &p, &link());

        assert_eq!(from_map, from_text);
        assert_eq!(from_map.delay_seconds, 5);
    }

    #[test]
    fn empty_strings_do_not_count_as_values() {
        let p = popup(Some(r#"{"name":"  ","button_text":""}"#));
        let resolved = resolve(&p, &link());
        assert_eq!(resolved.name, DEFAULT_NAME);
        assert_eq!(resolved.button_text, DEFAULT_BUTTON_TEXT);
    }

    #[test]
    fn non_object_json_is_treated_as_absent() {
        let resolved = resolve(&popup(Some("[1,2,3]")), &link());
        assert_eq!(resolved.button_text, DEFAULT_BUTTON_TEXT);
    }

    #[test]
    fn delay_comes_from_trigger_value_when_payload_has_none() {
        let mut p = popup(Some(r#"{"name":"x"}"#));
        p.trigger_value = Some("\"7\"".into());
        assert_eq!(resolve(&p, &link()).delay_seconds, 7);

        p.trigger_value = Some("0".into());
        assert_eq!(resolve(&p, &link()).delay_seconds, 0);

        p.trigger_value = Some("-4".into());
        assert_eq!(resolve(&p, &link()).delay_seconds, 0);
    }

    #[test]
    fn scroll_trigger_reads_its_threshold() {
        let mut p = popup(None);
        p.trigger_type = "scroll".into();
        p.trigger_value = Some("75".into());
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.trigger, Trigger::Scroll { percent: 75 });
        // Delay trigger values are not borrowed for other trigger kinds.
        assert_eq!(resolved.delay_seconds, DEFAULT_DELAY_SECONDS);

        p.trigger_value = None;
        assert_eq!(
            resolve(&p, &link()).trigger,
            Trigger::Scroll {
                percent: DEFAULT_SCROLL_PERCENT
            }
        );
    }

    #[test]
    fn malformed_styles_fall_back() {
        let mut p = popup(None);
        p.styles = Some("{oops".into());
        assert_eq!(resolve(&p, &link()).styles, PopupStyles::default());
    }

    #[test]
    fn resolution_is_deterministic() {
        let p = popup(Some(r#"{"button_text":"Buy Now"}"#));
        assert_eq!(resolve(&p, &link()), resolve(&p, &link()));
    }

    #[test]
    fn script_urls_fall_back_to_safe_values() {
        let p = popup(Some(
            r#"{"button_link":"javascript:alert(document.domain)","buttonUrl":"https://shop.example","image_url":"data:text/html,x","profile_image":"/relative.png"}"#,
        ));
        let resolved = resolve(&p, &link());

        assert_eq!(resolved.button_url, "https://shop.example");
        assert_eq!(resolved.image_url, None);
        assert_eq!(resolved.profile_image_url, None);

        let only_script = popup(Some(r#"{"button_link":"JavaScript:alert(1)"}"#));
        assert_eq!(resolve(&only_script, &link()).button_url, "https://example.com");
    }

    #[test]
    fn invalid_url_keys_are_reported() {
        let raw = RawContent::from_value(json!({ "button_text": "Go", "videoUrl": "vbscript:x" }));
        assert_eq!(invalid_url_key(raw), Some("videoUrl"));

        let raw = RawContent::from_value(json!({ "button_link": "https://ok.example" }));
        assert_eq!(invalid_url_key(raw), None);
    }

    #[test]
    fn style_values_cannot_inject_declarations() {
        let mut p = popup(None);
        p.styles = Some(
            r#"{"backgroundColor":"red; position:fixed; inset:0","textColor":"rgb(1, 2, 3)","width":"50%"}"#
                .into(),
        );
        let styles = resolve(&p, &link()).styles;

        assert_eq!(styles.background_color, "#ffffff");
        assert_eq!(styles.text_color, "rgb(1, 2, 3)");
        assert_eq!(styles.width, "50%");
        assert!(!is_css_value("url(javascript:alert(1))"));
        assert!(!is_css_value("red}"));
    }
}
