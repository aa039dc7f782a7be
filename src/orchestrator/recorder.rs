//! Persistence hook for orchestrated turns.

use async_trait::async_trait;

use crate::completion::ConversationTurn;
use crate::error::Result;
use crate::store::{NewMessage, SharedMessageLog};

/// Receives each agent turn as soon as it is obtained
#[async_trait]
pub trait TurnRecorder: Send + Sync {
    async fn record(&self, turn: &ConversationTurn) -> Result<()>;
}

/// Appends turns to the conversation log under one persona, keeping the
/// turn's speaker name
pub struct LogRecorder {
    log: SharedMessageLog,
    persona_id: i64,
}

impl LogRecorder {
    pub fn new(log: SharedMessageLog, persona_id: i64) -> Self {
        Self { log, persona_id }
    }
}

#[async_trait]
impl TurnRecorder for LogRecorder {
    async fn record(&self, turn: &ConversationTurn) -> Result<()> {
        self.log
            .append(NewMessage::from_agent(
                self.persona_id,
                turn.response.clone(),
                Some(turn.persona.clone()),
            ))
            .await?;
        Ok(())
    }
}
