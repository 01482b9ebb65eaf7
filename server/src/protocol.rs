//! Inbound frame parsing for viewer connections.
//!
//! Clients send UTF-8 JSON text frames of the form:
//!
//! ```json
//! { "type": "subscribe", "contest_id": "<room id>" }
//! { "type": "unsubscribe", "contest_id": "<room id>" }
//! { "type": "message", "contest_id": "<room id>", "text": "<chat text>" }
//! ```
//!
//! Anything else (malformed JSON, an unknown `type`, a missing room, an
//! empty chat text) is discarded. A bad frame never closes the connection.

use serde::Deserialize;
use tracing::debug;

use crate::types::ContestId;

/// An application-level action requested by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Start receiving events for a contest room.
    Subscribe(ContestId),

    /// Stop receiving events for a contest room.
    Unsubscribe(ContestId),

    /// Post a chat message into a contest.
    PostMessage { contest_id: ContestId, text: String },
}

#[derive(Debug, Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    contest_id: String,
    #[serde(default)]
    text: String,
}

/// Parses a text frame into a [`ClientAction`].
///
/// Returns `None` for every frame that should be ignored.
pub fn parse_client_frame(raw: &str) -> Option<ClientAction> {
    let frame: RawClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, len = raw.len(), "Discarding malformed frame");
            return None;
        }
    };

    if frame.contest_id.is_empty() {
        debug!(kind = %frame.kind, "Discarding frame without contest_id");
        return None;
    }

    let contest_id = ContestId::new(frame.contest_id);
    match frame.kind.as_str() {
        "subscribe" => Some(ClientAction::Subscribe(contest_id)),
        "unsubscribe" => Some(ClientAction::Unsubscribe(contest_id)),
        "message" if frame.text.is_empty() => {
            debug!(contest_id = %contest_id, "Discarding chat frame with empty text");
            None
        }
        "message" => Some(ClientAction::PostMessage {
            contest_id,
            text: frame.text,
        }),
        other => {
            debug!(kind = %other, "Discarding frame with unknown type");
            None
        }
    }
}
