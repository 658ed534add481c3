//! Shared test fixtures: database setup and intent-event builders.

use sqlx::SqlitePool;

use crate::event::{
    GameRef, LikePayload, LoginPayload, StartGamePayload, StreamEventData,
    TotallyOrderedStreamEvent, UserRef,
};

/// Centralized test database setup. Creates an in-memory SQLite database
/// with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Inbound event as received from upstream: `stream_id` is the upstream
/// authority's own output id for it.
pub(crate) fn inbound(
    stream_id: i64,
    total_order_id: i64,
    data: StreamEventData,
) -> TotallyOrderedStreamEvent {
    TotallyOrderedStreamEvent {
        stream_id,
        total_order_id,
        data,
    }
}

pub(crate) fn login_intent(
    stream_id: i64,
    total_order_id: i64,
    email: &str,
) -> TotallyOrderedStreamEvent {
    inbound(
        stream_id,
        total_order_id,
        StreamEventData::UserLoginIntended(LoginPayload {
            user: UserRef {
                email: email.to_string(),
            },
        }),
    )
}

pub(crate) fn like_intent(
    stream_id: i64,
    total_order_id: i64,
    email: &str,
    game_id: i64,
) -> TotallyOrderedStreamEvent {
    inbound(
        stream_id,
        total_order_id,
        StreamEventData::LikeIntended(LikePayload {
            user: UserRef {
                email: email.to_string(),
            },
            game: GameRef { game_id },
        }),
    )
}

pub(crate) fn game_started_intent(
    stream_id: i64,
    total_order_id: i64,
    email: &str,
) -> TotallyOrderedStreamEvent {
    inbound(
        stream_id,
        total_order_id,
        StreamEventData::GameStartedIntended(StartGamePayload {
            user: UserRef {
                email: email.to_string(),
            },
        }),
    )
}
