//! Append-only output log persistence. Rows are keyed by the locally issued
//! `stream_id` (unique) and carry the upstream `total_order_id` plus the
//! JSON-encoded payload.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::StreamStoreError;
use crate::event::TotallyOrderedStreamEvent;

fn decode_row(row: &SqliteRow) -> Result<TotallyOrderedStreamEvent, StreamStoreError> {
    let stream_id: i64 = row.get("stream_id");
    let total_order_id: i64 = row.get("total_order_id");
    let raw: String = row.get("data");

    let data = serde_json::from_str(&raw)
        .map_err(|source| StreamStoreError::Decode { stream_id, source })?;

    Ok(TotallyOrderedStreamEvent {
        stream_id,
        total_order_id,
        data,
    })
}

pub(crate) async fn insert(
    sql_tx: &mut Transaction<'_, Sqlite>,
    event: &TotallyOrderedStreamEvent,
) -> Result<(), StreamStoreError> {
    let data = serde_json::to_string(&event.data).map_err(StreamStoreError::Encode)?;

    sqlx::query("INSERT INTO stream_out (stream_id, total_order_id, data) VALUES (?1, ?2, ?3)")
        .bind(event.stream_id)
        .bind(event.total_order_id)
        .bind(data)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(())
}

/// Events strictly after `(total_order_id, stream_id)` in position order.
/// This is the replica-fetch query: a downstream node passes its cursor and
/// receives everything it has not applied yet.
pub(crate) async fn find_after_position(
    pool: &SqlitePool,
    total_order_id: i64,
    stream_id: i64,
    limit: Option<i64>,
) -> Result<Vec<TotallyOrderedStreamEvent>, StreamStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT stream_id, total_order_id, data
        FROM stream_out
        WHERE total_order_id > ?1 OR (total_order_id = ?1 AND stream_id > ?2)
        ORDER BY total_order_id ASC, stream_id ASC
        LIMIT ?3
        "#,
    )
    .bind(total_order_id)
    .bind(stream_id)
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_row).collect()
}

/// Bounded listing in `stream_id` order. `end_id` is inclusive; a `limit`
/// of `None` means unbounded (SQLite treats LIMIT -1 as no limit).
pub(crate) async fn find_range(
    pool: &SqlitePool,
    after_id: i64,
    end_id: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<TotallyOrderedStreamEvent>, StreamStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT stream_id, total_order_id, data
        FROM stream_out
        WHERE stream_id > ?1 AND (?2 IS NULL OR stream_id <= ?2)
        ORDER BY stream_id ASC
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(after_id)
    .bind(end_id)
    .bind(limit.unwrap_or(-1))
    .bind(offset.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_row).collect()
}

/// All events sharing the newest `total_order_id`, in `stream_id` order.
/// Used to re-announce the latest batch to subscribers on startup.
pub(crate) async fn most_recent_batch(
    pool: &SqlitePool,
) -> Result<Vec<TotallyOrderedStreamEvent>, StreamStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT stream_id, total_order_id, data
        FROM stream_out
        WHERE total_order_id = (SELECT MAX(total_order_id) FROM stream_out)
        ORDER BY stream_id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_row).collect()
}

#[cfg(test)]
pub(crate) async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM stream_out")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LoginPayload, StreamEventData, UserRef};
    use crate::test_utils::setup_test_db;

    fn login_succeeded(stream_id: i64, total_order_id: i64) -> TotallyOrderedStreamEvent {
        TotallyOrderedStreamEvent {
            stream_id,
            total_order_id,
            data: StreamEventData::UserLoginSucceeded(LoginPayload {
                user: UserRef {
                    email: format!("user{stream_id}@example.com"),
                },
            }),
        }
    }

    async fn seed(pool: &SqlitePool, events: &[TotallyOrderedStreamEvent]) {
        let mut sql_tx = pool.begin().await.unwrap();
        for event in events {
            insert(&mut sql_tx, event).await.unwrap();
        }
        sql_tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn insert_then_find_range() {
        let pool = setup_test_db().await;
        seed(
            &pool,
            &[
                login_succeeded(1, 1),
                login_succeeded(2, 1),
                login_succeeded(3, 2),
            ],
        )
        .await;

        let all = find_range(&pool, 0, None, None, None).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.stream_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let bounded = find_range(&pool, 1, Some(2), None, None).await.unwrap();
        assert_eq!(
            bounded.iter().map(|e| e.stream_id).collect::<Vec<_>>(),
            vec![2]
        );

        let limited = find_range(&pool, 0, None, Some(2), Some(1)).await.unwrap();
        assert_eq!(
            limited.iter().map(|e| e.stream_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn duplicate_stream_id_is_rejected() {
        let pool = setup_test_db().await;
        seed(&pool, &[login_succeeded(1, 1)]).await;

        let mut sql_tx = pool.begin().await.unwrap();
        insert(&mut sql_tx, &login_succeeded(1, 2)).await.unwrap_err();
    }

    #[tokio::test]
    async fn find_after_position_is_lexicographic() {
        let pool = setup_test_db().await;
        seed(
            &pool,
            &[
                login_succeeded(1, 1),
                login_succeeded(2, 2),
                login_succeeded(3, 2),
                login_succeeded(4, 3),
            ],
        )
        .await;

        // Mid-batch position: the rest of batch 2 plus batch 3.
        let after = find_after_position(&pool, 2, 2, None).await.unwrap();
        assert_eq!(
            after.iter().map(|e| e.stream_id).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let none = find_after_position(&pool, 3, 4, None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn most_recent_batch_returns_newest_total_order() {
        let pool = setup_test_db().await;

        assert!(most_recent_batch(&pool).await.unwrap().is_empty());

        seed(
            &pool,
            &[
                login_succeeded(1, 1),
                login_succeeded(2, 2),
                login_succeeded(3, 2),
            ],
        )
        .await;

        let batch = most_recent_batch(&pool).await.unwrap();
        assert_eq!(
            batch.iter().map(|e| e.stream_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(batch.iter().all(|e| e.total_order_id == 2));
    }
}
