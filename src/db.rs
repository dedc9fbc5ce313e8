use crate::models::{EventType, LinkWithPopup, NewAnalyticsEvent, Popup, ShortLink};
use chrono::Utc;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    FromRow, Row, SqlitePool,
};
use std::str::FromStr;

const LINK_COLUMNS: &str = "id, user_id, popup_id, slug, destination_url, title, description,
     active, clicks, created_at, updated_at, og_title, og_description, og_image";

const POPUP_COLUMNS: &str = "id, user_id, name, content, type, position, trigger_type,
     trigger_value, styles, active, frequency_cap, targeting_rules, created_at, updated_at";

// ── Pool ───────────────────────────────────────────────────────────────────

/// Open the SQLite pool, creating the database file if it doesn't exist yet.
/// In-memory databases need `max_connections = 1`: each connection would
/// otherwise get its own empty database.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Run the embedded migrations (files in migrations/).
pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

// ── Redirect flow ──────────────────────────────────────────────────────────

/// Fetch a link by slug together with its popup in a single query. Inactive
/// links are returned too; the resolver decides what to do with them.
pub async fn find_link_by_slug(
    pool: &SqlitePool,
    slug: &str,
) -> Result<Option<LinkWithPopup>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT l.id, l.user_id, l.popup_id, l.slug, l.destination_url, l.title,
                l.description, l.active, l.clicks, l.created_at, l.updated_at,
                l.og_title, l.og_description, l.og_image,
                p.id              AS p_id,
                p.user_id         AS p_user_id,
                p.name            AS p_name,
                p.content         AS p_content,
                p.type            AS p_type,
                p.position        AS p_position,
                p.trigger_type    AS p_trigger_type,
                p.trigger_value   AS p_trigger_value,
                p.styles          AS p_styles,
                p.active          AS p_active,
                p.frequency_cap   AS p_frequency_cap,
                p.targeting_rules AS p_targeting_rules,
                p.created_at      AS p_created_at,
                p.updated_at      AS p_updated_at
         FROM short_links l
         LEFT JOIN popups p ON p.id = l.popup_id
         WHERE l.slug = ?1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let link = ShortLink::from_row(&row)?;
    let popup = joined_popup(&row)?;
    Ok(Some(LinkWithPopup { link, popup }))
}

fn joined_popup(row: &SqliteRow) -> Result<Option<Popup>, sqlx::Error> {
    let Some(id) = row.try_get::<Option<String>, _>("p_id")? else {
        return Ok(None);
    };

    Ok(Some(Popup {
        id,
        user_id: row.try_get("p_user_id")?,
        name: row.try_get("p_name")?,
        content: row.try_get("p_content")?,
        popup_type: row.try_get("p_type")?,
        position: row.try_get("p_position")?,
        trigger_type: row.try_get("p_trigger_type")?,
        trigger_value: row.try_get("p_trigger_value")?,
        styles: row.try_get("p_styles")?,
        active: row.try_get("p_active")?,
        frequency_cap: row.try_get("p_frequency_cap")?,
        targeting_rules: row.try_get("p_targeting_rules")?,
        created_at: row.try_get("p_created_at")?,
        updated_at: row.try_get("p_updated_at")?,
    }))
}

/// Overwrite the click counter with a value computed by the caller.
pub async fn update_clicks(pool: &SqlitePool, link_id: &str, clicks: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE short_links SET clicks = ?1 WHERE id = ?2")
        .bind(clicks)
        .bind(link_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Append one analytics row. Designed to be called from a spawned background
/// task so the visitor never waits on it.
pub async fn insert_event(pool: &SqlitePool, event: &NewAnalyticsEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO analytics
             (id, short_link_id, popup_id, visitor_id, referrer, browser, device, os,
              country, city, ip_address, event_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )
    .bind(&event.id)
    .bind(&event.short_link_id)
    .bind(&event.popup_id)
    .bind(&event.visitor_id)
    .bind(&event.referrer)
    .bind(&event.browser)
    .bind(&event.device)
    .bind(&event.os)
    .bind(&event.country)
    .bind(&event.city)
    .bind(&event.ip_address)
    .bind(event.event_type.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn count_events(
    pool: &SqlitePool,
    popup_id: &str,
    visitor_id: &str,
    event_type: EventType,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM analytics
         WHERE popup_id = ?1 AND visitor_id = ?2 AND event_type = ?3",
    )
    .bind(popup_id)
    .bind(visitor_id)
    .bind(event_type.as_str())
    .fetch_one(pool)
    .await
}

// ── Management ─────────────────────────────────────────────────────────────

pub async fn slug_exists(pool: &SqlitePool, slug: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM short_links WHERE slug = ?1")
        .bind(slug)
        .fetch_one(pool)
        .await?;

    Ok(count > 0)
}

/// Insert a link and, first, the popup it points at, in one transaction.
pub async fn create_link(
    pool: &SqlitePool,
    link: &ShortLink,
    popup: Option<&Popup>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    if let Some(popup) = popup {
        sqlx::query(
            "INSERT INTO popups
                 (id, user_id, name, content, type, position, trigger_type, trigger_value,
                  styles, active, frequency_cap, targeting_rules, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&popup.id)
        .bind(&popup.user_id)
        .bind(&popup.name)
        .bind(&popup.content)
        .bind(&popup.popup_type)
        .bind(&popup.position)
        .bind(&popup.trigger_type)
        .bind(&popup.trigger_value)
        .bind(&popup.styles)
        .bind(popup.active)
        .bind(popup.frequency_cap)
        .bind(&popup.targeting_rules)
        .bind(popup.created_at)
        .bind(popup.updated_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO short_links
             (id, user_id, popup_id, slug, destination_url, title, description, active,
              clicks, created_at, updated_at, og_title, og_description, og_image)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )
    .bind(&link.id)
    .bind(&link.user_id)
    .bind(&link.popup_id)
    .bind(&link.slug)
    .bind(&link.destination_url)
    .bind(&link.title)
    .bind(&link.description)
    .bind(link.active)
    .bind(link.clicks)
    .bind(link.created_at)
    .bind(link.updated_at)
    .bind(&link.og_title)
    .bind(&link.og_description)
    .bind(&link.og_image)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// All links owned by `user_id`, newest first.
pub async fn list_links(pool: &SqlitePool, user_id: &str) -> Result<Vec<ShortLink>, sqlx::Error> {
    let sql =
        format!("SELECT {LINK_COLUMNS} FROM short_links WHERE user_id = ?1 ORDER BY created_at DESC");
    sqlx::query_as(&sql)
        .bind(user_id)
        .fetch_all(pool)
        .await
}

pub async fn get_link(pool: &SqlitePool, id: &str) -> Result<Option<ShortLink>, sqlx::Error> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM short_links WHERE id = ?1");
    sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_popup(pool: &SqlitePool, id: &str) -> Result<Option<Popup>, sqlx::Error> {
    let sql = format!("SELECT {POPUP_COLUMNS} FROM popups WHERE id = ?1");
    sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Write every editable popup column and bump `updated_at`.
pub async fn update_popup(pool: &SqlitePool, popup: &Popup) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE popups
         SET name = ?1, content = ?2, type = ?3, position = ?4, trigger_type = ?5,
             trigger_value = ?6, styles = ?7, active = ?8, frequency_cap = ?9,
             targeting_rules = ?10, updated_at = ?11
         WHERE id = ?12",
    )
    .bind(&popup.name)
    .bind(&popup.content)
    .bind(&popup.popup_type)
    .bind(&popup.position)
    .bind(&popup.trigger_type)
    .bind(&popup.trigger_value)
    .bind(&popup.styles)
    .bind(popup.active)
    .bind(popup.frequency_cap)
    .bind(&popup.targeting_rules)
    .bind(Utc::now().naive_utc())
    .bind(&popup.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a link and its popup. Analytics rows cascade with the link.
pub async fn delete_link(pool: &SqlitePool, link: &ShortLink) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let affected = sqlx::query("DELETE FROM short_links WHERE id = ?1")
        .bind(&link.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if let Some(popup_id) = &link.popup_id {
        sqlx::query("DELETE FROM popups WHERE id = ?1")
            .bind(popup_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(affected > 0)
}
