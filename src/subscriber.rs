//! Registered fan-out targets. Registration is idempotent by URL;
//! unregistering reports whether anything was actually removed so the API
//! layer can answer 404 for unknown URLs.

use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub(crate) struct HttpSubscriber {
    pub(crate) id: i64,
    pub(crate) url: String,
}

/// Returns true when the URL was newly registered, false when it already
/// existed. Both are success.
pub(crate) async fn register(pool: &SqlitePool, url: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("INSERT OR IGNORE INTO http_subscribers (url) VALUES (?1)")
        .bind(url)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Returns true when a subscriber was removed.
pub(crate) async fn unregister(pool: &SqlitePool, url: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM http_subscribers WHERE url = ?1")
        .bind(url)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn list(pool: &SqlitePool) -> Result<Vec<HttpSubscriber>, sqlx::Error> {
    sqlx::query_as::<_, HttpSubscriber>("SELECT id, url FROM http_subscribers ORDER BY id ASC")
        .fetch_all(pool)
        .await
}
