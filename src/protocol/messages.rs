//! Session message definitions
//!
//! Inbound frames are JSON objects with an optional `action` discriminator
//! (default `"message"`). Outbound frames carry exactly one of `response`,
//! `conversation` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::completion::ConversationTurn;
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────

/// Request kinds a session understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Message,
    LlmToLlm,
    MultiLlm,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Message => "message",
            Action::LlmToLlm => "llm_to_llm",
            Action::MultiLlm => "multi_llm",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Action::Message),
            "llm_to_llm" => Some(Action::LlmToLlm),
            "multi_llm" => Some(Action::MultiLlm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Single turn; text is trimmed and non-empty
    Message { text: String },

    /// Two-party exchange. Prompts are checked by the orchestrator.
    LlmToLlm {
        prompt_1: String,
        prompt_2: String,
        iterations: Option<i64>,
        persona_1: Option<String>,
        persona_2: Option<String>,
    },

    /// Round-robin debate
    MultiLlm {
        selected_personas: Vec<String>,
        claim: String,
        iterations: Option<i64>,
    },
}

impl ClientRequest {
    /// Parse a text frame.
    ///
    /// Fails with `MalformedJson` when the frame is not JSON and with
    /// `BadRequest` when it is JSON but not a usable request.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|_| Error::MalformedJson)?;
        let Value::Object(fields) = value else {
            return Err(Error::bad_request("Request must be a JSON object"));
        };

        let action = match fields.get("action") {
            None | Some(Value::Null) => Action::Message,
            Some(Value::String(name)) => {
                Action::from_wire(name).ok_or_else(|| Error::bad_request("Invalid action type"))?
            }
            Some(_) => return Err(Error::bad_request("Invalid action type")),
        };

        match action {
            Action::Message => {
                let text = string_field(&fields, "message")?.unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    return Err(Error::bad_request("No message provided"));
                }
                Ok(ClientRequest::Message {
                    text: text.to_string(),
                })
            }
            Action::LlmToLlm => Ok(ClientRequest::LlmToLlm {
                prompt_1: string_field(&fields, "prompt_1")?.unwrap_or_default(),
                prompt_2: string_field(&fields, "prompt_2")?.unwrap_or_default(),
                iterations: iterations_field(&fields)?,
                persona_1: persona_field(&fields, "persona_1")?,
                persona_2: persona_field(&fields, "persona_2")?,
            }),
            Action::MultiLlm => Ok(ClientRequest::MultiLlm {
                selected_personas: persona_list(&fields)?,
                claim: string_field(&fields, "claim")?.unwrap_or_default(),
                iterations: iterations_field(&fields)?,
            }),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            ClientRequest::Message { .. } => Action::Message,
            ClientRequest::LlmToLlm { .. } => Action::LlmToLlm,
            ClientRequest::MultiLlm { .. } => Action::MultiLlm,
        }
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::bad_request(format!("'{}' must be a string", name))),
    }
}

/// Optional persona override; blank counts as absent
fn persona_field(fields: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    Ok(string_field(fields, name)?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn persona_list(fields: &Map<String, Value>) -> Result<Vec<String>> {
    const NOT_A_LIST: &str = "'selected_personas' must be a list of persona names";

    match fields.get("selected_personas") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(name) => Ok(name.trim().to_string()),
                _ => Err(Error::bad_request(NOT_A_LIST)),
            })
            .collect(),
        Some(_) => Err(Error::bad_request(NOT_A_LIST)),
    }
}

/// Only JSON integers are accepted; range is checked by the orchestrator
fn iterations_field(fields: &Map<String, Value>) -> Result<Option<i64>> {
    match fields.get("iterations") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::bad_request("'iterations' must be a positive integer")),
        Some(_) => Err(Error::bad_request("'iterations' must be a positive integer")),
    }
}

// ─────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────

/// A frame sent back to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Response { response: String },
    Conversation { conversation: Vec<ConversationTurn> },
    Error { error: String },
}

impl Reply {
    pub fn response(text: impl Into<String>) -> Self {
        Reply::Response {
            response: text.into(),
        }
    }

    pub fn conversation(turns: Vec<ConversationTurn>) -> Self {
        Reply::Conversation {
            conversation: turns,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            error: message.into(),
        }
    }

    /// Wire-safe error reply for a failed request
    pub fn from_error(err: &Error) -> Self {
        Reply::error(err.client_message())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"error":"Internal error"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<ClientRequest> {
        ClientRequest::parse(&value.to_string())
    }

    #[test]
    fn test_action_defaults_to_message() {
        let request = parse(json!({"message": "  Hello, LLM!  "})).unwrap();
        assert_eq!(
            request,
            ClientRequest::Message {
                text: "Hello, LLM!".into()
            }
        );

        let request = parse(json!({"action": null, "message": "hi"})).unwrap();
        assert_eq!(request.action(), Action::Message);
    }

    #[test]
    fn test_malformed_and_non_object_frames() {
        assert!(matches!(
            ClientRequest::parse("{not json"),
            Err(Error::MalformedJson)
        ));
        assert!(matches!(
            ClientRequest::parse("[1, 2]"),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_unknown_action() {
        for action in [json!("dance"), json!(7), json!({"x": 1})] {
            let err = parse(json!({"action": action})).unwrap_err();
            assert_eq!(err.client_message(), "Invalid action type");
        }
    }

    #[test]
    fn test_blank_message() {
        for body in [json!({}), json!({"message": "   "}), json!({"message": null})] {
            let err = parse(body).unwrap_err();
            assert_eq!(err.client_message(), "No message provided");
        }
        let err = parse(json!({"message": 5})).unwrap_err();
        assert_eq!(err.client_message(), "'message' must be a string");
    }

    #[test]
    fn test_llm_to_llm_fields() {
        let request = parse(json!({
            "action": "llm_to_llm",
            "prompt_1": "Hi",
            "prompt_2": "Hello",
            "iterations": 4,
            "persona_2": "  Critic "
        }))
        .unwrap();

        assert_eq!(
            request,
            ClientRequest::LlmToLlm {
                prompt_1: "Hi".into(),
                prompt_2: "Hello".into(),
                iterations: Some(4),
                persona_1: None,
                persona_2: Some("Critic".into()),
            }
        );
    }

    #[test]
    fn test_iterations_must_be_an_integer() {
        for bad in [json!(2.5), json!("3"), json!(true)] {
            let err = parse(json!({"action": "llm_to_llm", "iterations": bad})).unwrap_err();
            assert_eq!(err.client_message(), "'iterations' must be a positive integer");
        }
        // Range is not checked here
        let request = parse(json!({"action": "multi_llm", "iterations": -1})).unwrap();
        assert!(matches!(request, ClientRequest::MultiLlm { iterations: Some(-1), .. }));
    }

    #[test]
    fn test_multi_llm_fields() {
        let request = parse(json!({
            "action": "multi_llm",
            "selected_personas": ["Plato", " Hume "],
            "claim": "Free will exists"
        }))
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::MultiLlm {
                selected_personas: vec!["Plato".into(), "Hume".into()],
                claim: "Free will exists".into(),
                iterations: None,
            }
        );

        let missing = parse(json!({"action": "multi_llm"})).unwrap();
        assert!(matches!(missing, ClientRequest::MultiLlm { ref selected_personas, .. } if selected_personas.is_empty()));

        let err = parse(json!({"action": "multi_llm", "selected_personas": "Plato"})).unwrap_err();
        assert!(err.client_message().contains("selected_personas"));
    }

    #[test]
    fn test_reply_wire_shapes() {
        assert_eq!(Reply::response("hi").to_json(), r#"{"response":"hi"}"#);
        assert_eq!(Reply::error("nope").to_json(), r#"{"error":"nope"}"#);
        assert_eq!(
            Reply::conversation(vec![ConversationTurn::new("A", "x")]).to_json(),
            r#"{"conversation":[{"persona":"A","response":"x"}]}"#
        );
    }

    #[test]
    fn test_reply_from_error_is_wire_safe() {
        let reply = Reply::from_error(&Error::Internal("db path /secret".into()));
        assert!(reply.is_error());
        assert!(!reply.to_json().contains("/secret"));
    }
}
