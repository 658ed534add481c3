//! Singleton upstream checkpoint.
//!
//! The cursor records the highest upstream position this node has durably
//! applied: the upstream-assigned `stream_id` of the last inbound event and
//! the `total_order_id` of its batch. It is advanced only inside the same
//! transaction that writes the batch's output events, so "events written
//! but cursor behind" is not a reachable state.

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCursor {
    pub stream_id: i64,
    pub total_order_id: i64,
}

impl UpstreamCursor {
    pub(crate) const ZERO: Self = Self {
        stream_id: 0,
        total_order_id: 0,
    };
}

/// Idempotently creates the singleton row, then reads it. The insert is a
/// write statement, so the transaction holds the writer lock from here on.
pub(crate) async fn ensure(
    sql_tx: &mut Transaction<'_, Sqlite>,
) -> Result<UpstreamCursor, sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO upstream_cursor (id, stream_id, total_order_id) VALUES (0, 0, 0)",
    )
    .execute(sql_tx.as_mut())
    .await?;

    sqlx::query_as::<_, UpstreamCursor>(
        "SELECT stream_id, total_order_id FROM upstream_cursor WHERE id = 0",
    )
    .fetch_one(sql_tx.as_mut())
    .await
}

/// Current cursor outside any transaction; zero if the row does not exist
/// yet.
pub(crate) async fn get(pool: &SqlitePool) -> Result<UpstreamCursor, sqlx::Error> {
    let cursor = sqlx::query_as::<_, UpstreamCursor>(
        "SELECT stream_id, total_order_id FROM upstream_cursor WHERE id = 0",
    )
    .fetch_optional(pool)
    .await?;

    Ok(cursor.unwrap_or(UpstreamCursor::ZERO))
}

pub(crate) async fn advance(
    sql_tx: &mut Transaction<'_, Sqlite>,
    cursor: UpstreamCursor,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE upstream_cursor SET stream_id = ?1, total_order_id = ?2 WHERE id = 0")
        .bind(cursor.stream_id)
        .bind(cursor.total_order_id)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let pool = setup_test_db().await;

        let mut sql_tx = pool.begin().await.unwrap();
        assert_eq!(ensure(&mut sql_tx).await.unwrap(), UpstreamCursor::ZERO);
        assert_eq!(ensure(&mut sql_tx).await.unwrap(), UpstreamCursor::ZERO);
        sql_tx.commit().await.unwrap();

        assert_eq!(get(&pool).await.unwrap(), UpstreamCursor::ZERO);
    }

    #[tokio::test]
    async fn advance_commits_with_transaction() {
        let pool = setup_test_db().await;

        let target = UpstreamCursor {
            stream_id: 4,
            total_order_id: 2,
        };

        let mut sql_tx = pool.begin().await.unwrap();
        ensure(&mut sql_tx).await.unwrap();
        advance(&mut sql_tx, target).await.unwrap();
        drop(sql_tx);

        // Rolled back: still zero.
        assert_eq!(get(&pool).await.unwrap(), UpstreamCursor::ZERO);

        let mut sql_tx = pool.begin().await.unwrap();
        ensure(&mut sql_tx).await.unwrap();
        advance(&mut sql_tx, target).await.unwrap();
        sql_tx.commit().await.unwrap();

        assert_eq!(get(&pool).await.unwrap(), target);
    }
}
