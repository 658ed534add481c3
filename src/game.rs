use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};

/// A game saturates once it has collected this many likes; further likes
/// fail at intake.
pub(crate) const LIKE_CAP: i64 = 50;

/// Game aggregate. `game_id` is issued by the game sequence counter; the
/// database row id never leaves the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub game_id: i64,
    pub like_count: i64,
}

pub(crate) async fn find_by_game_id(
    sql_tx: &mut Transaction<'_, Sqlite>,
    game_id: i64,
) -> Result<Option<GameRecord>, sqlx::Error> {
    sqlx::query_as::<_, GameRecord>("SELECT game_id, like_count FROM games WHERE game_id = ?1")
        .bind(game_id)
        .fetch_optional(sql_tx.as_mut())
        .await
}

pub(crate) async fn insert(
    sql_tx: &mut Transaction<'_, Sqlite>,
    game_id: i64,
) -> Result<GameRecord, sqlx::Error> {
    sqlx::query("INSERT INTO games (game_id, like_count) VALUES (?1, 0)")
        .bind(game_id)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(GameRecord {
        game_id,
        like_count: 0,
    })
}

pub(crate) async fn set_like_count(
    sql_tx: &mut Transaction<'_, Sqlite>,
    game_id: i64,
    like_count: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE games SET like_count = ?1 WHERE game_id = ?2")
        .bind(like_count)
        .bind(game_id)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(())
}
