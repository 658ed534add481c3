//! Wire and storage model for the totally ordered stream.
//!
//! Every event is a `(stream_id, total_order_id, data)` triple. `stream_id`
//! is issued locally and defines this node's total order; `total_order_id`
//! is assigned by the upstream authority and is shared by every event
//! produced from the same inbound batch. `data` is a closed tagged union
//! serialized as `{"type": ..., "payload": ...}` JSON.

use serde::{Deserialize, Serialize};

use crate::game::GameRecord;
use crate::user::UserRecord;

/// One persisted event of the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotallyOrderedStreamEvent {
    pub stream_id: i64,
    pub total_order_id: i64,
    pub data: StreamEventData,
}

/// Wire envelope shared across the replication protocol: inbound pushes,
/// upstream fetch responses, and subscriber fan-out all carry a batch as
/// `{ totalOrderId, events }`. One node's outgoing notification is the next
/// node's inbound batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBatch {
    pub total_order_id: i64,
    pub events: Vec<TotallyOrderedStreamEvent>,
}

/// Reference to a user by email, used in intent payloads before the user
/// aggregate necessarily exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub email: String,
}

/// Reference to a game by its issued id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRef {
    pub game_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub user: UserRef,
}

/// Carries the created user record, issued id included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserPayload {
    pub user: UserRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikePayload {
    pub user: UserRef,
    pub game: GameRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartGamePayload {
    pub user: UserRef,
}

/// Game lifecycle payloads deliberately carry only the game record, never
/// the acting user's email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePayload {
    pub game: GameRecord,
}

/// Tagged event payload union.
///
/// Intent events describe a requested action; the remaining variants are the
/// authoritative record of what actually happened. `Unknown` absorbs tags
/// this node does not recognize so that a newer upstream cannot poison the
/// projection; the projection logs and skips them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StreamEventData {
    #[serde(rename = "user-login-intended")]
    UserLoginIntended(LoginPayload),
    #[serde(rename = "create-new-user-succeeded")]
    CreateNewUserSucceeded(NewUserPayload),
    #[serde(rename = "user-login-succeeded")]
    UserLoginSucceeded(LoginPayload),
    #[serde(rename = "like-intended")]
    LikeIntended(LikePayload),
    #[serde(rename = "like-succeeded")]
    LikeSucceeded(LikePayload),
    #[serde(rename = "like-failed")]
    LikeFailed(LikePayload),
    #[serde(rename = "game-started-intended")]
    GameStartedIntended(StartGamePayload),
    #[serde(rename = "game-started-succeeded")]
    GameStartedSucceeded(GamePayload),
    #[serde(rename = "game-updated")]
    GameUpdated(GamePayload),
    #[serde(rename = "game-completed")]
    GameCompleted(GamePayload),
    #[serde(other)]
    Unknown,
}

impl StreamEventData {
    /// Tag name as it appears on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserLoginIntended(_) => "user-login-intended",
            Self::CreateNewUserSucceeded(_) => "create-new-user-succeeded",
            Self::UserLoginSucceeded(_) => "user-login-succeeded",
            Self::LikeIntended(_) => "like-intended",
            Self::LikeSucceeded(_) => "like-succeeded",
            Self::LikeFailed(_) => "like-failed",
            Self::GameStartedIntended(_) => "game-started-intended",
            Self::GameStartedSucceeded(_) => "game-started-succeeded",
            Self::GameUpdated(_) => "game-updated",
            Self::GameCompleted(_) => "game-completed",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_like_intended() {
        let event = TotallyOrderedStreamEvent {
            stream_id: 7,
            total_order_id: 3,
            data: StreamEventData::LikeIntended(LikePayload {
                user: UserRef {
                    email: "a@example.com".to_string(),
                },
                game: GameRef { game_id: 2 },
            }),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "streamId": 7,
                "totalOrderId": 3,
                "data": {
                    "type": "like-intended",
                    "payload": {
                        "user": { "email": "a@example.com" },
                        "game": { "gameId": 2 }
                    }
                }
            })
        );

        let back: TotallyOrderedStreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unrecognized_tag_decodes_as_unknown() {
        let raw = json!({
            "streamId": 1,
            "totalOrderId": 1,
            "data": { "type": "achievement-unlocked", "payload": { "whatever": true } }
        });

        let event: TotallyOrderedStreamEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.data, StreamEventData::Unknown);
        assert_eq!(event.data.kind(), "unknown");
    }

    #[test]
    fn game_payload_serializes_issued_ids() {
        let data = StreamEventData::GameCompleted(GamePayload {
            game: GameRecord {
                game_id: 4,
                like_count: 50,
            },
        });

        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "game-completed",
                "payload": { "game": { "gameId": 4, "likeCount": 50 } }
            })
        );
    }
}
