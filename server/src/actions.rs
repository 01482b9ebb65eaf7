//! Handling of actions sent by viewers over their connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chat::{ChatError, ChatService};
use crate::connection::{ActionHandler, Connection};
use crate::hub::HubHandle;
use crate::protocol::ClientAction;

/// Routes viewer actions to the hub and the chat service.
#[derive(Clone)]
pub struct ContestActions {
    hub: HubHandle,
    chat: Arc<dyn ChatService>,
}

impl ContestActions {
    pub fn new(hub: HubHandle, chat: Arc<dyn ChatService>) -> Self {
        Self { hub, chat }
    }
}

#[async_trait]
impl ActionHandler for ContestActions {
    async fn handle(&self, connection: &Arc<Connection>, action: ClientAction) {
        match action {
            ClientAction::Subscribe(contest_id) => {
                self.hub.subscribe(connection.id(), contest_id).await;
            }
            ClientAction::Unsubscribe(contest_id) => {
                self.hub.unsubscribe(connection.id(), contest_id).await;
            }
            ClientAction::PostMessage { contest_id, text } => {
                let user_id = connection.user_id();
                match self.chat.create_message(&contest_id, user_id, &text).await {
                    Ok(_) => {}
                    Err(err @ ChatError::RateLimited { .. }) => {
                        debug!(user_id = %user_id, contest_id = %contest_id, error = %err, "Chat message dropped");
                    }
                    Err(err) => {
                        warn!(user_id = %user_id, contest_id = %contest_id, error = %err, "Chat message rejected");
                    }
                }
            }
        }
    }
}
