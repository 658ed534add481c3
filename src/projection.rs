//! The event projection state machine.
//!
//! [`project_event`] consumes one inbound intent event inside the caller's
//! transaction and turns it into zero or more output events while mutating
//! the affected aggregates. Every output consumes exactly one allocation
//! from the `stream_out` counter and carries the inbound event's
//! `total_order_id`, so a batch's outputs sort into the global order right
//! where their cause does.
//!
//! Intent events are echoed through as the first output where the table
//! below says so: downstream consumers then see both the request and its
//! resolution in one ordered stream and never have to correlate requests
//! out of band.
//!
//! | input                   | outputs (in order)                                            |
//! |-------------------------|---------------------------------------------------------------|
//! | `user-login-intended`   | `create-new-user-succeeded` (first login only),               |
//! |                         | `user-login-succeeded`                                        |
//! | `like-intended`         | `like-intended`, then `like-succeeded` + `game-updated` /     |
//! |                         | `game-completed`, or `like-failed`                            |
//! | `game-started-intended` | `game-started-intended`, `game-started-succeeded`             |
//! | anything else           | none                                                          |

use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};

use crate::error::ProjectionError;
use crate::event::{GamePayload, NewUserPayload, StreamEventData, TotallyOrderedStreamEvent};
use crate::game::{self, GameRecord, LIKE_CAP};
use crate::sequence::{SequenceAllocation, SequenceKind};
use crate::stream_out;
use crate::user;

/// Allocates the next `stream_id`, persists the output event, and records it
/// in the produced batch.
async fn emit(
    sql_tx: &mut Transaction<'_, Sqlite>,
    sequence: &mut SequenceAllocation,
    total_order_id: i64,
    data: StreamEventData,
    outputs: &mut Vec<TotallyOrderedStreamEvent>,
) -> Result<(), ProjectionError> {
    let event = TotallyOrderedStreamEvent {
        stream_id: sequence.next(),
        total_order_id,
        data,
    };
    stream_out::insert(sql_tx, &event).await?;
    outputs.push(event);
    Ok(())
}

/// Runs one inbound event through the state machine. Either every output
/// event and aggregate mutation in the returned batch commits with the
/// caller's transaction, or none do.
#[tracing::instrument(
    skip_all,
    fields(kind = event.data.kind(), total_order_id = event.total_order_id),
    level = tracing::Level::DEBUG
)]
pub(crate) async fn project_event(
    sql_tx: &mut Transaction<'_, Sqlite>,
    event: &TotallyOrderedStreamEvent,
) -> Result<Vec<TotallyOrderedStreamEvent>, ProjectionError> {
    let mut sequence = SequenceAllocation::acquire(sql_tx, SequenceKind::StreamOut).await?;
    let mut outputs = Vec::new();
    let total_order_id = event.total_order_id;

    match &event.data {
        StreamEventData::UserLoginIntended(payload) => {
            let email = &payload.user.email;
            if user::find_by_email(sql_tx, email).await?.is_none() {
                let mut user_sequence =
                    SequenceAllocation::acquire(sql_tx, SequenceKind::User).await?;
                let created = user::insert(sql_tx, user_sequence.next(), email).await?;
                user_sequence.persist(sql_tx).await?;

                debug!(user_id = created.user_id, "created new user");
                emit(
                    sql_tx,
                    &mut sequence,
                    total_order_id,
                    StreamEventData::CreateNewUserSucceeded(NewUserPayload { user: created }),
                    &mut outputs,
                )
                .await?;
            }

            emit(
                sql_tx,
                &mut sequence,
                total_order_id,
                StreamEventData::UserLoginSucceeded(payload.clone()),
                &mut outputs,
            )
            .await?;
        }

        StreamEventData::LikeIntended(payload) => {
            // Echo the intent first so consumers see request and resolution
            // adjacent in the stream.
            emit(
                sql_tx,
                &mut sequence,
                total_order_id,
                StreamEventData::LikeIntended(payload.clone()),
                &mut outputs,
            )
            .await?;

            let game = game::find_by_game_id(sql_tx, payload.game.game_id).await?;
            match game {
                Some(game) if game.like_count < LIKE_CAP => {
                    emit(
                        sql_tx,
                        &mut sequence,
                        total_order_id,
                        StreamEventData::LikeSucceeded(payload.clone()),
                        &mut outputs,
                    )
                    .await?;

                    let updated = GameRecord {
                        game_id: game.game_id,
                        like_count: game.like_count + 1,
                    };
                    game::set_like_count(sql_tx, updated.game_id, updated.like_count).await?;

                    let data = if updated.like_count == LIKE_CAP {
                        StreamEventData::GameCompleted(GamePayload { game: updated })
                    } else {
                        StreamEventData::GameUpdated(GamePayload { game: updated })
                    };
                    emit(sql_tx, &mut sequence, total_order_id, data, &mut outputs).await?;
                }
                _ => {
                    // Missing game or saturated: a defined failure branch,
                    // not a transaction abort.
                    emit(
                        sql_tx,
                        &mut sequence,
                        total_order_id,
                        StreamEventData::LikeFailed(payload.clone()),
                        &mut outputs,
                    )
                    .await?;
                }
            }
        }

        StreamEventData::GameStartedIntended(payload) => {
            emit(
                sql_tx,
                &mut sequence,
                total_order_id,
                StreamEventData::GameStartedIntended(payload.clone()),
                &mut outputs,
            )
            .await?;

            let mut game_sequence = SequenceAllocation::acquire(sql_tx, SequenceKind::Game).await?;
            let created = game::insert(sql_tx, game_sequence.next()).await?;
            game_sequence.persist(sql_tx).await?;

            debug!(game_id = created.game_id, "created new game");
            emit(
                sql_tx,
                &mut sequence,
                total_order_id,
                StreamEventData::GameStartedSucceeded(GamePayload { game: created }),
                &mut outputs,
            )
            .await?;
        }

        StreamEventData::Unknown => {
            warn!(total_order_id, "dropping event with unrecognized type tag");
        }

        // Result events arriving on the inbound stream are already the
        // outcome of some other node's projection; nothing to do here.
        _ => {}
    }

    sequence.persist(sql_tx).await?;
    Ok(outputs)
}
