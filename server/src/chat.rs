//! Contest chat posting.
//!
//! Viewers post chat lines over their WebSocket. A [`ChatService`] validates
//! the text, builds the [`ChatMessage`] and fans it out to the contest room
//! as a `chat_message` event. Messages are not persisted by the hub.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::hub::HubHandle;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::types::{ChatMessage, ChatMessageId, ContestId, HubEvent, UserId};

/// Longest accepted chat text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Default sustained chat rate per user (messages per second).
pub const DEFAULT_CHAT_RATE: f64 = 1.0;

/// Default chat burst per user.
pub const DEFAULT_CHAT_BURST: u32 = 5;

/// Reasons a chat post is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("text is required")]
    EmptyText,

    #[error("text is too long (max {max} characters)")]
    TooLong { max: usize },

    #[error("posting too fast, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// Creates chat messages on behalf of authenticated users.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn create_message(
        &self,
        contest_id: &ContestId,
        user_id: UserId,
        text: &str,
    ) -> Result<ChatMessage, ChatError>;
}

/// Checks chat text against the posting rules.
pub fn validate_text(text: &str) -> Result<(), ChatError> {
    if text.trim().is_empty() {
        return Err(ChatError::EmptyText);
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::TooLong {
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}

/// [`ChatService`] that broadcasts every accepted message to its room.
#[derive(Debug, Clone)]
pub struct BroadcastingChatService {
    hub: HubHandle,
    limiter: RateLimiter<UserId>,
}

impl BroadcastingChatService {
    pub fn new(hub: HubHandle, limiter: RateLimiter<UserId>) -> Self {
        Self { hub, limiter }
    }
}

#[async_trait]
impl ChatService for BroadcastingChatService {
    async fn create_message(
        &self,
        contest_id: &ContestId,
        user_id: UserId,
        text: &str,
    ) -> Result<ChatMessage, ChatError> {
        validate_text(text)?;

        if let RateLimitResult::Limited { retry_after_secs } = self.limiter.check(user_id).await {
            debug!(user_id = %user_id, contest_id = %contest_id, "Chat rate limit exceeded");
            return Err(ChatError::RateLimited { retry_after_secs });
        }

        let now = Utc::now();
        let message = ChatMessage {
            id: ChatMessageId::new(Uuid::new_v4().to_string()),
            contest_id: contest_id.clone(),
            user_id,
            user_name: String::new(),
            text: text.to_string(),
            is_system: false,
            created_at: now,
            updated_at: now,
        };

        self.hub.broadcast_to_room(
            contest_id,
            &HubEvent::ChatMessage {
                contest_id: contest_id.clone(),
                message: message.clone(),
            },
        );
        info!(
            message_id = %message.id,
            contest_id = %contest_id,
            user_id = %user_id,
            "Chat message posted"
        );

        Ok(message)
    }
}
