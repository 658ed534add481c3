use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};

/// User aggregate. `user_id` is issued by the user sequence counter and is
/// the only id that appears in event payloads; the database row id never
/// leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: i64,
    pub email: String,
}

pub(crate) async fn find_by_email(
    sql_tx: &mut Transaction<'_, Sqlite>,
    email: &str,
) -> Result<Option<UserRecord>, sqlx::Error> {
    sqlx::query_as::<_, UserRecord>("SELECT user_id, email FROM users WHERE email = ?1")
        .bind(email)
        .fetch_optional(sql_tx.as_mut())
        .await
}

pub(crate) async fn insert(
    sql_tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    email: &str,
) -> Result<UserRecord, sqlx::Error> {
    sqlx::query("INSERT INTO users (user_id, email) VALUES (?1, ?2)")
        .bind(user_id)
        .bind(email)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(UserRecord {
        user_id,
        email: email.to_string(),
    })
}

#[cfg(test)]
pub(crate) async fn count(pool: &sqlx::SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    #[tokio::test]
    async fn insert_then_find_by_email() {
        let pool = setup_test_db().await;
        let mut sql_tx = pool.begin().await.unwrap();

        let created = insert(&mut sql_tx, 1, "a@example.com").await.unwrap();
        assert_eq!(created.user_id, 1);

        let found = find_by_email(&mut sql_tx, "a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);

        assert!(
            find_by_email(&mut sql_tx, "b@example.com")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let pool = setup_test_db().await;
        let mut sql_tx = pool.begin().await.unwrap();

        insert(&mut sql_tx, 1, "a@example.com").await.unwrap();
        insert(&mut sql_tx, 2, "a@example.com").await.unwrap_err();
    }
}
