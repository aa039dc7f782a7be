//! Mock completion backend for testing
//!
//! Deterministic answers, scripted failures and call recording, so session
//! and orchestrator tests run without a completion service.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

use super::traits::{CompletionBackend, CompletionRequest, ConversationTurn, RoundRobinRequest};

// ─────────────────────────────────────────────────────────────────
// Mock Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock backend behavior
#[derive(Debug, Clone, Default)]
pub struct MockCompletionConfig {
    /// Simulated latency per call
    pub latency: Duration,

    /// Fixed single-turn answer (for deterministic testing)
    pub fixed_response: Option<String>,

    /// Fail the N-th single-turn call (1-based)
    pub fail_on_call: Option<u32>,

    /// Fail every call
    pub fail_always: bool,

    /// Fixed round-robin conversation
    pub conversation: Option<Vec<ConversationTurn>>,
}

/// Track call counts for verification
#[derive(Debug, Default)]
struct CallLog {
    complete: u32,
    round_robin: u32,
    requests: Vec<CompletionRequest>,
}

// ─────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────

pub struct MockCompletionBackend {
    config: MockCompletionConfig,
    calls: RwLock<CallLog>,
}

impl MockCompletionBackend {
    pub fn new() -> Self {
        Self::with_config(MockCompletionConfig::default())
    }

    pub fn with_config(config: MockCompletionConfig) -> Self {
        Self {
            config,
            calls: RwLock::new(CallLog::default()),
        }
    }

    /// Mock that answers every single turn with `text`
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::with_config(MockCompletionConfig {
            fixed_response: Some(text.into()),
            ..Default::default()
        })
    }

    /// Mock whose every call fails with a 503
    pub fn failing() -> Self {
        Self::with_config(MockCompletionConfig {
            fail_always: true,
            ..Default::default()
        })
    }

    pub fn complete_calls(&self) -> u32 {
        self.calls.read().complete
    }

    pub fn round_robin_calls(&self) -> u32 {
        self.calls.read().round_robin
    }

    /// Single-turn requests in the order received
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.calls.read().requests.clone()
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    fn scripted_failure() -> Error {
        Error::UpstreamStatus {
            status: 503,
            body: "mock failure".to_string(),
        }
    }
}

impl Default for MockCompletionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionBackend for MockCompletionBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let call = {
            let mut calls = self.calls.write();
            calls.complete += 1;
            calls.requests.push(request.clone());
            calls.complete
        };

        self.simulate_latency().await;

        if self.config.fail_always || self.config.fail_on_call == Some(call) {
            return Err(Self::scripted_failure());
        }

        Ok(match self.config.fixed_response {
            Some(ref fixed) => fixed.clone(),
            None => format!("{} (turn {}): {}", request.persona_name, call, request.prompt),
        })
    }

    async fn round_robin(&self, request: &RoundRobinRequest) -> Result<Vec<ConversationTurn>> {
        self.calls.write().round_robin += 1;
        self.simulate_latency().await;

        if self.config.fail_always {
            return Err(Self::scripted_failure());
        }

        if let Some(ref conversation) = self.config.conversation {
            return Ok(conversation.clone());
        }

        let mut turns = Vec::new();
        for round in 1..=request.iterations {
            for persona in &request.selected_personas {
                turns.push(ConversationTurn::new(
                    persona.clone(),
                    format!("{} on '{}', round {}", persona, request.claim, round),
                ));
            }
        }
        Ok(turns)
    }
}
