//! Request dispatch for an active session
//!
//! [`Session::handle_text`] is the catch boundary: every error and every
//! panic raised while serving a frame becomes an `{"error": ...}` reply and
//! the session carries on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::orchestrator::{Exchange, LogRecorder, RoundRobinPlan, TwoPartyPlan};
use crate::persona::Persona;
use crate::protocol::{ClientRequest, Reply};
use crate::router::ConnectionId;
use crate::store::NewMessage;

use super::{Admission, SessionContext, SessionStrategy};

/// An admitted connection's request handler
pub struct Session {
    ctx: Arc<SessionContext>,
    connection: ConnectionId,
    user: UserIdentity,
    persona: Persona,
    group: String,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, connection: ConnectionId, admission: Admission) -> Self {
        Self {
            ctx,
            connection,
            user: admission.user,
            persona: admission.persona,
            group: admission.group,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Serve one text frame. Never fails and never panics outward.
    pub async fn handle_text(&self, text: &str) -> Reply {
        match AssertUnwindSafe(self.dispatch(text)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                match &e {
                    Error::MalformedJson | Error::BadRequest(_) => {
                        debug!(connection_id = %self.connection, error = %e, "Request rejected")
                    }
                    _ if e.is_upstream() => warn!(
                        connection_id = %self.connection,
                        error = %e.format_for_log(),
                        "Completion request failed"
                    ),
                    _ => error!(
                        connection_id = %self.connection,
                        error = %e.format_for_log(),
                        "Request failed"
                    ),
                }
                Reply::from_error(&e)
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(connection_id = %self.connection, panic = %detail, "Request handler panicked");
                Reply::from_error(&Error::Internal(detail))
            }
        }
    }

    /// Reply to a binary frame
    pub fn handle_binary(&self) -> Reply {
        Reply::from_error(&Error::MalformedJson)
    }

    /// Whether a reply should also reach the other members of the group
    pub fn should_fan_out(&self, reply: &Reply) -> bool {
        self.ctx.settings.fan_out
            && !reply.is_error()
            && self.ctx.settings.strategy != SessionStrategy::EchoOnlyStub
    }

    async fn dispatch(&self, text: &str) -> Result<Reply> {
        let request = ClientRequest::parse(text)?;

        info!(
            connection_id = %self.connection,
            user_id = self.user.id,
            persona = %self.persona.name,
            action = %request.action(),
            "Handling request"
        );

        if self.ctx.settings.strategy == SessionStrategy::EchoOnlyStub {
            return match request {
                ClientRequest::Message { text } => self.echo(text).await,
                _ => Err(Error::bad_request("Action not available in echo mode")),
            };
        }

        match request {
            ClientRequest::Message { text } => self.single_turn(text).await,
            ClientRequest::LlmToLlm {
                prompt_1,
                prompt_2,
                iterations,
                persona_1,
                persona_2,
            } => {
                let plan = TwoPartyPlan {
                    prompt_1,
                    prompt_2,
                    iterations,
                    persona_1: self.speaker(persona_1).await?,
                    persona_2: self.speaker(persona_2).await?,
                };
                let exchange = self
                    .ctx
                    .orchestrator
                    .run_two_party(&plan, &self.recorder())
                    .await?;
                Ok(self.exchange_reply(exchange))
            }
            ClientRequest::MultiLlm {
                selected_personas,
                claim,
                iterations,
            } => {
                let plan = RoundRobinPlan {
                    selected_personas,
                    claim,
                    iterations,
                };
                let exchange = self
                    .ctx
                    .orchestrator
                    .run_round_robin(&plan, &self.recorder())
                    .await?;
                Ok(self.exchange_reply(exchange))
            }
        }
    }

    async fn single_turn(&self, text: String) -> Result<Reply> {
        self.ctx
            .log
            .append(NewMessage::from_user(self.user.id, self.persona.id, text.clone()))
            .await?;

        let response = self
            .ctx
            .orchestrator
            .single_turn(&text, &self.persona.name)
            .await?;

        self.ctx
            .log
            .append(NewMessage::from_agent(self.persona.id, response.clone(), None))
            .await?;

        Ok(Reply::response(response))
    }

    async fn echo(&self, text: String) -> Result<Reply> {
        self.ctx
            .log
            .append(NewMessage::from_user(self.user.id, self.persona.id, text.clone()))
            .await?;
        Ok(Reply::response(format!("Message received: {}", text)))
    }

    /// Requested speaker if it exists, else the session persona
    async fn speaker(&self, requested: Option<String>) -> Result<String> {
        match requested {
            None => Ok(self.persona.name.clone()),
            Some(name) if name == self.persona.name => Ok(name),
            Some(name) => {
                if self.ctx.directory.validate(&name).await? {
                    Ok(name)
                } else {
                    Err(Error::bad_request(format!("Unknown persona '{}'", name)))
                }
            }
        }
    }

    fn recorder(&self) -> LogRecorder {
        LogRecorder::new(self.ctx.log.clone(), self.persona.id)
    }

    fn exchange_reply(&self, exchange: Exchange) -> Reply {
        match exchange {
            Exchange::Completed(turns) => Reply::conversation(turns),
            Exchange::Failed { reason, persisted } => {
                // Turns recorded before the failure stay in the log
                warn!(
                    connection_id = %self.connection,
                    persona = %self.persona.name,
                    persisted,
                    reason = %reason,
                    "Agent exchange failed"
                );
                Reply::error(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::completion::{MockCompletionBackend, MockCompletionConfig};
    use crate::session::testing::{context, context_with, Fixture};
    use crate::session::{admit, ConnectTarget};
    use crate::session::testing::token_for;
    use crate::store::{MessageLog, UserStore};

    async fn session_for(fixture: &Fixture, persona: &str) -> Session {
        let alice = fixture.store.ensure_user("alice").await.unwrap();
        let target = ConnectTarget {
            path: format!("/ws/llm/{}", persona),
            query: Some(format!("token={}", token_for(&alice))),
            authorization: None,
        };
        let admission = admit(&fixture.ctx, &target).await.unwrap();
        Session::new(fixture.ctx.clone(), ConnectionId::new(), admission)
    }

    #[tokio::test]
    async fn test_message_round_trip_persists_two_rows() {
        let fixture = context_with(
            SessionStrategy::UserScopedAutocreate,
            MockCompletionBackend::fixed("Hello, human."),
        );
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(&json!({"action": "message", "message": "Hello, LLM!"}).to_string())
            .await;
        assert_eq!(reply, Reply::response("Hello, human."));
        assert!(session.should_fan_out(&reply));

        let rows = fixture.store.history(session.persona.id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_from_user);
        assert_eq!(rows[0].content, "Hello, human.");
        assert!(rows[1].is_from_user);
        assert_eq!(rows[1].sender_user_id, Some(session.user.id));
        assert_eq!(fixture.completion.requests()[0].persona_name, "Muse");
    }

    #[tokio::test]
    async fn test_malformed_frame_then_valid() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        let reply = session.handle_text("{oops").await;
        assert_eq!(
            reply,
            Reply::error("Invalid message format. Please send a valid JSON.")
        );
        assert!(!session.should_fan_out(&reply));

        let reply = session.handle_text(r#"{"message": "hi"}"#).await;
        assert!(!reply.is_error());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_only_user_row() {
        let fixture = context_with(SessionStrategy::UserScopedAutocreate, MockCompletionBackend::failing());
        let session = session_for(&fixture, "Muse").await;

        let reply = session.handle_text(r#"{"message": "hi"}"#).await;
        assert_eq!(reply, Reply::error("Completion service returned status 503"));

        let rows = fixture.store.history(session.persona.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_from_user);
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_session_usable() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        assert_eq!(
            session.handle_text(r#"{"action": "sing"}"#).await,
            Reply::error("Invalid action type")
        );
        assert_eq!(
            session.handle_binary(),
            Reply::error("Invalid message format. Please send a valid JSON.")
        );
    }

    #[tokio::test]
    async fn test_two_party_reply_and_rows() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(
                &json!({
                    "action": "llm_to_llm",
                    "prompt_1": "Open",
                    "prompt_2": "Respond",
                    "iterations": 3
                })
                .to_string(),
            )
            .await;

        let Reply::Conversation { conversation } = reply else {
            panic!("expected conversation, got {:?}", reply);
        };
        let speakers: Vec<_> = conversation.iter().map(|t| t.persona.as_str()).collect();
        assert_eq!(speakers, ["Muse (1)", "Muse (2)", "Muse (1)"]);

        let rows = fixture.store.history(session.persona.id, 10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.is_from_user && r.sender_user_id.is_none()));
        let recorded: Vec<_> = rows.iter().rev().map(|r| r.speaker.clone().unwrap()).collect();
        assert_eq!(recorded, ["Muse (1)", "Muse (2)", "Muse (1)"]);
    }

    #[tokio::test]
    async fn test_two_party_failure_reply() {
        let fixture = context_with(
            SessionStrategy::UserScopedAutocreate,
            MockCompletionBackend::with_config(MockCompletionConfig {
                fail_on_call: Some(1),
                ..Default::default()
            }),
        );
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(r#"{"action": "llm_to_llm", "prompt_1": "a", "prompt_2": "b"}"#)
            .await;
        assert_eq!(
            reply,
            Reply::error("LLM-to-LLM interaction failed: Completion service returned status 503")
        );
        assert!(fixture.store.history(session.persona.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_party_unknown_speaker() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(
                r#"{"action": "llm_to_llm", "prompt_1": "a", "prompt_2": "b", "persona_2": "Nobody"}"#,
            )
            .await;
        assert_eq!(reply, Reply::error("Unknown persona 'Nobody'"));
        assert_eq!(fixture.completion.complete_calls(), 0);
    }

    #[tokio::test]
    async fn test_multi_party_single_persona_rejected_locally() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(r#"{"action": "multi_llm", "selected_personas": ["Muse"], "claim": "x"}"#)
            .await;
        assert_eq!(reply, Reply::error("At least two personas are required"));
        assert_eq!(fixture.completion.round_robin_calls(), 0);
    }

    #[tokio::test]
    async fn test_multi_party_rows_keep_speaker() {
        let fixture = context(SessionStrategy::UserScopedAutocreate);
        let session = session_for(&fixture, "Muse").await;

        let reply = session
            .handle_text(
                r#"{"action": "multi_llm", "selected_personas": ["Plato", "Hume"], "claim": "x", "iterations": 1}"#,
            )
            .await;
        assert!(matches!(reply, Reply::Conversation { ref conversation } if conversation.len() == 2));

        let rows = fixture.store.history(session.persona.id, 10).await.unwrap();
        let speakers: Vec<_> = rows.iter().rev().map(|r| r.speaker.clone().unwrap()).collect();
        assert_eq!(speakers, ["Plato", "Hume"]);
    }

    #[tokio::test]
    async fn test_echo_mode() {
        let fixture = context(SessionStrategy::EchoOnlyStub);
        let session = session_for(&fixture, "Muse").await;

        let reply = session.handle_text(r#"{"message": "ping"}"#).await;
        assert_eq!(reply, Reply::response("Message received: ping"));
        assert!(!session.should_fan_out(&reply));

        let reply = session
            .handle_text(r#"{"action": "multi_llm", "selected_personas": ["a", "b"], "claim": "c"}"#)
            .await;
        assert_eq!(reply, Reply::error("Action not available in echo mode"));

        assert_eq!(fixture.completion.complete_calls(), 0);
        let rows = fixture.store.history(session.persona.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_from_user);
    }
}
