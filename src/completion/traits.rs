//! Completion service contract
//!
//! The relay never generates text itself. A [`CompletionBackend`] answers
//! single prompts on behalf of a persona and runs whole multi-persona
//! conversations remotely.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────
// Requests & Results
// ─────────────────────────────────────────────────────────────────

/// One prompt answered in the voice of one persona
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub persona_name: String,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, persona_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            persona_name: persona_name.into(),
        }
    }
}

/// A remote round-robin debate between several personas
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundRobinRequest {
    pub selected_personas: Vec<String>,
    pub claim: String,
    pub iterations: u32,
}

/// One persona's contribution to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub persona: String,
    pub response: String,
}

impl ConversationTurn {
    pub fn new(persona: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            response: response.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Backend Trait
// ─────────────────────────────────────────────────────────────────

/// Remote text generation used by the turn orchestrator.
///
/// Every call is bounded by the implementation's own timeout and fails with
/// one of the upstream error variants.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Answer a single prompt as the given persona
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Run a whole round-robin conversation and return its turns in order
    async fn round_robin(&self, request: &RoundRobinRequest) -> Result<Vec<ConversationTurn>>;
}

/// Thread-safe shared backend handle
pub type SharedCompletion = Arc<dyn CompletionBackend>;
