//! Shared types for the TopPet realtime hub.
//!
//! This module defines the identifiers, the chat message model, and the
//! closed set of events pushed to contest viewers. Field names are part of
//! the wire contract consumed by the web and mobile clients: variants may be
//! added, but the shape of an existing variant must never change.

use std::fmt;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A serialized outbound frame, shared between every recipient of a dispatch.
///
/// Reference counted: cloning it per recipient and handing it to the socket
/// never copies the payload.
pub type Frame = Utf8Bytes;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns `true` if the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a contest. Also identifies the contest's realtime room.
    ContestId
);

string_id!(
    /// Identifier of a contest participant (a pet entry).
    ParticipantId
);

string_id!(
    /// Identifier of a chat message.
    ChatMessageId
);

/// Identifier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle stage of a contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestStatus {
    Draft,
    Registration,
    Voting,
    Finished,
}

/// A chat message as shown to contest viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ChatMessageId,
    pub contest_id: ContestId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub text: String,
    #[serde(default)]
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Vote totals after a vote was cast or withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub contest_id: ContestId,
    pub participant_id: ParticipantId,
    pub participant_total_votes: i64,
    pub contest_total_votes: i64,
}

/// An event pushed to the viewers of a contest.
///
/// Serialized as a flat JSON object with a `type` discriminator; every
/// variant carries the `contest_id` of the room it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// The contest moved to a new stage.
    ContestStatusUpdated {
        contest_id: ContestId,
        status: ContestStatus,
    },

    /// A vote was cast for a participant.
    VoteCreated(VoteTally),

    /// A vote was withdrawn from a participant.
    VoteDeleted(VoteTally),

    /// Totals changed for a participant (emitted on vote upsert and withdrawal).
    VoteCountsUpdated(VoteTally),

    /// The receiving user's own vote changed.
    ///
    /// `participant_id` is empty when the vote was removed. Only ever sent
    /// to the voting user.
    UserVoteUpdated {
        contest_id: ContestId,
        participant_id: ParticipantId,
    },

    /// A new chat message was posted.
    ChatMessage {
        contest_id: ContestId,
        message: ChatMessage,
    },

    /// A chat message was edited.
    MessageUpdated {
        contest_id: ContestId,
        message: ChatMessage,
    },

    /// A chat message was deleted.
    MessageDeleted {
        contest_id: ContestId,
        message_id: ChatMessageId,
    },
}

impl HubEvent {
    /// Returns the room this event belongs to.
    pub fn contest_id(&self) -> &ContestId {
        match self {
            Self::ContestStatusUpdated { contest_id, .. }
            | Self::UserVoteUpdated { contest_id, .. }
            | Self::ChatMessage { contest_id, .. }
            | Self::MessageUpdated { contest_id, .. }
            | Self::MessageDeleted { contest_id, .. } => contest_id,
            Self::VoteCreated(tally) | Self::VoteDeleted(tally) | Self::VoteCountsUpdated(tally) => {
                &tally.contest_id
            }
        }
    }

    /// Returns the wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContestStatusUpdated { .. } => "contest_status_updated",
            Self::VoteCreated(_) => "vote_created",
            Self::VoteDeleted(_) => "vote_deleted",
            Self::VoteCountsUpdated(_) => "vote_counts_updated",
            Self::UserVoteUpdated { .. } => "user_vote_updated",
            Self::ChatMessage { .. } => "chat_message",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
        }
    }

    /// Serializes the event into a shareable text frame.
    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// An outbound message routed by the hub.
///
/// Immutable once built. `target_user` restricts delivery to the connections
/// of a single user inside the room.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub contest_id: ContestId,
    pub target_user: Option<UserId>,
    pub kind: &'static str,
    pub frame: Frame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn sample_message() -> ChatMessage {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        ChatMessage {
            id: ChatMessageId::new("m-1"),
            contest_id: ContestId::new("c-1"),
            user_id: UserId(7),
            user_name: "rex".to_string(),
            text: "good boy".to_string(),
            is_system: false,
            created_at: at,
            updated_at: at,
        }
    }

    fn to_value(event: &HubEvent) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn contest_status_updated_wire_shape() {
        let event = HubEvent::ContestStatusUpdated {
            contest_id: "c-1".into(),
            status: ContestStatus::Voting,
        };
        assert_eq!(
            to_value(&event),
            json!({"type": "contest_status_updated", "contest_id": "c-1", "status": "voting"})
        );
    }

    #[test]
    fn vote_variants_share_the_tally_shape() {
        let tally = VoteTally {
            contest_id: "c-1".into(),
            participant_id: "p-1".into(),
            participant_total_votes: 3,
            contest_total_votes: 10,
        };

        for (event, tag) in [
            (HubEvent::VoteCreated(tally.clone()), "vote_created"),
            (HubEvent::VoteDeleted(tally.clone()), "vote_deleted"),
            (HubEvent::VoteCountsUpdated(tally.clone()), "vote_counts_updated"),
        ] {
            assert_eq!(
                to_value(&event),
                json!({
                    "type": tag,
                    "contest_id": "c-1",
                    "participant_id": "p-1",
                    "participant_total_votes": 3,
                    "contest_total_votes": 10,
                })
            );
            assert_eq!(event.kind(), tag);
        }
    }

    #[test]
    fn user_vote_updated_keeps_empty_participant_on_removal() {
        let event = HubEvent::UserVoteUpdated {
            contest_id: "c-1".into(),
            participant_id: ParticipantId::default(),
        };
        assert_eq!(
            to_value(&event),
            json!({"type": "user_vote_updated", "contest_id": "c-1", "participant_id": ""})
        );
    }

    #[test]
    fn chat_message_embeds_full_message() {
        let event = HubEvent::ChatMessage {
            contest_id: "c-1".into(),
            message: sample_message(),
        };
        let value = to_value(&event);
        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["contest_id"], "c-1");
        assert_eq!(value["message"]["id"], "m-1");
        assert_eq!(value["message"]["user_id"], 7);
        assert_eq!(value["message"]["text"], "good boy");
        assert_eq!(value["message"]["is_system"], false);
        assert_eq!(value["message"]["created_at"], "2026-03-01T12:00:00Z");
    }

    #[test]
    fn message_deleted_carries_only_the_identifier() {
        let event = HubEvent::MessageDeleted {
            contest_id: "c-1".into(),
            message_id: "m-9".into(),
        };
        assert_eq!(
            to_value(&event),
            json!({"type": "message_deleted", "contest_id": "c-1", "message_id": "m-9"})
        );
    }

    #[test]
    fn contest_id_is_reported_for_every_variant() {
        let events = [
            HubEvent::MessageUpdated {
                contest_id: "c-2".into(),
                message: sample_message(),
            },
            HubEvent::VoteDeleted(VoteTally {
                contest_id: "c-2".into(),
                participant_id: "p-1".into(),
                participant_total_votes: 0,
                contest_total_votes: 0,
            }),
            HubEvent::UserVoteUpdated {
                contest_id: "c-2".into(),
                participant_id: "p-1".into(),
            },
        ];
        for event in &events {
            assert_eq!(event.contest_id().as_str(), "c-2");
        }
    }

    #[test]
    fn events_deserialize_from_service_payloads() {
        let raw = r#"{"type":"contest_status_updated","contest_id":"c-1","status":"finished"}"#;
        let event: HubEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            HubEvent::ContestStatusUpdated {
                contest_id: "c-1".into(),
                status: ContestStatus::Finished,
            }
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = r#"{"type":"contest_status_updated","contest_id":"c-1","status":"paused"}"#;
        assert!(serde_json::from_str::<HubEvent>(raw).is_err());
    }

    #[test]
    fn encode_produces_json_text() {
        let event = HubEvent::MessageDeleted {
            contest_id: "c-1".into(),
            message_id: "m-1".into(),
        };
        let frame = event.encode().unwrap();
        let decoded: HubEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn identifiers_display_raw_values() {
        assert_eq!(ContestId::new("c-1").to_string(), "c-1");
        assert_eq!(UserId(42).to_string(), "42");
        assert!(ParticipantId::default().is_empty());
    }
}
