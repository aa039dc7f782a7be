//! Turn orchestrator
//!
//! Drives every call to the completion service on behalf of a session:
//! - single turns answering one user message
//! - two-party loops run locally, one completion call per turn
//! - round-robin debates delegated to the completion service in one call
//!
//! Request fields are validated before any remote call. Agent turns are
//! handed to a [`TurnRecorder`] as soon as they are obtained, so a run that
//! fails midway keeps what it produced.

mod recorder;

pub use recorder::{LogRecorder, TurnRecorder};

use tracing::{debug, info, warn};

use crate::completion::{CompletionRequest, ConversationTurn, RoundRobinRequest, SharedCompletion};
use crate::error::{Error, Result};

/// Iterations used when a two-party request omits them
pub const DEFAULT_TWO_PARTY_ITERATIONS: u32 = 3;

/// Iterations used when a round-robin request omits them
pub const DEFAULT_ROUND_ROBIN_ITERATIONS: u32 = 5;

pub const MIN_ROUND_ROBIN_PERSONAS: usize = 2;
pub const MAX_ROUND_ROBIN_PERSONAS: usize = 5;

// ─────────────────────────────────────────────────────────────────
// Plans & Outcomes
// ─────────────────────────────────────────────────────────────────

/// A two-party exchange as requested by the client
#[derive(Debug, Clone, PartialEq)]
pub struct TwoPartyPlan {
    pub prompt_1: String,
    pub prompt_2: String,
    /// Raw requested count; `None` takes the default
    pub iterations: Option<i64>,
    pub persona_1: String,
    pub persona_2: String,
}

/// A round-robin debate as requested by the client
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRobinPlan {
    pub selected_personas: Vec<String>,
    pub claim: String,
    pub iterations: Option<i64>,
}

/// Result of an orchestrated run
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    /// Every turn, in speaking order
    Completed(Vec<ConversationTurn>),

    /// The run stopped on a completion failure. `persisted` turns were
    /// recorded before it did.
    Failed { reason: String, persisted: usize },
}

// ─────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────

pub struct TurnOrchestrator {
    backend: SharedCompletion,
    max_iterations: u32,
}

impl TurnOrchestrator {
    pub fn new(backend: SharedCompletion, max_iterations: u32) -> Self {
        info!(
            backend = backend.name(),
            max_iterations,
            "Turn orchestrator ready"
        );
        Self {
            backend,
            max_iterations,
        }
    }

    /// Answer one prompt as `persona_name`
    pub async fn single_turn(&self, prompt: &str, persona_name: &str) -> Result<String> {
        self.backend
            .complete(&CompletionRequest::new(prompt, persona_name))
            .await
    }

    /// Alternate two speakers for the requested number of turns.
    ///
    /// Turn 0 is speaker 1 answering `prompt_1`. Every later turn is the
    /// other speaker answering the previous text, preceded by that
    /// speaker's own seed prompt.
    pub async fn run_two_party(
        &self,
        plan: &TwoPartyPlan,
        recorder: &dyn TurnRecorder,
    ) -> Result<Exchange> {
        let prompt_1 = plan.prompt_1.trim();
        let prompt_2 = plan.prompt_2.trim();
        if prompt_1.is_empty() || prompt_2.is_empty() {
            return Err(Error::bad_request("Two initial prompts are required"));
        }
        let iterations = self.check_iterations(plan.iterations, DEFAULT_TWO_PARTY_ITERATIONS)?;

        let speakers = [
            (plan.persona_1.as_str(), prompt_1),
            (plan.persona_2.as_str(), prompt_2),
        ];
        let labels = slot_labels(&plan.persona_1, &plan.persona_2);

        debug!(
            persona_1 = %plan.persona_1,
            persona_2 = %plan.persona_2,
            iterations,
            "Starting two-party exchange"
        );

        let mut turns: Vec<ConversationTurn> = Vec::with_capacity(iterations as usize);
        for index in 0..iterations as usize {
            let (persona, seed) = speakers[index % 2];
            let label = &labels[index % 2];
            let prompt = match turns.last() {
                None => seed.to_string(),
                Some(previous) => format!("{}\n\n{}", seed, previous.response),
            };

            match self.single_turn(&prompt, persona).await {
                Ok(text) => {
                    let turn = ConversationTurn::new(label.as_str(), text);
                    recorder.record(&turn).await?;
                    turns.push(turn);
                }
                Err(e) if e.is_upstream() => {
                    warn!(
                        turn = index,
                        persona = %persona,
                        error = %e.format_for_log(),
                        "Two-party exchange aborted"
                    );
                    return Ok(Exchange::Failed {
                        reason: format!("LLM-to-LLM interaction failed: {}", e.client_message()),
                        persisted: turns.len(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Exchange::Completed(turns))
    }

    /// Validate a debate locally, then run it with one remote call
    pub async fn run_round_robin(
        &self,
        plan: &RoundRobinPlan,
        recorder: &dyn TurnRecorder,
    ) -> Result<Exchange> {
        let request = self.check_round_robin(plan)?;

        let turns = match self.backend.round_robin(&request).await {
            Ok(turns) => turns,
            Err(e @ Error::UpstreamMalformed { .. }) => {
                warn!(error = %e.format_for_log(), "Round-robin response rejected");
                return Ok(Exchange::Failed {
                    reason: e.client_message(),
                    persisted: 0,
                });
            }
            Err(e) if e.is_upstream() => {
                warn!(error = %e.format_for_log(), "Round-robin call failed");
                return Ok(Exchange::Failed {
                    reason: format!("Multi-LLM interaction failed: {}", e.client_message()),
                    persisted: 0,
                });
            }
            Err(e) => return Err(e),
        };

        for turn in &turns {
            recorder.record(turn).await?;
        }

        debug!(turns = turns.len(), "Round-robin debate recorded");
        Ok(Exchange::Completed(turns))
    }

    fn check_round_robin(&self, plan: &RoundRobinPlan) -> Result<RoundRobinRequest> {
        let count = plan.selected_personas.len();
        if count < MIN_ROUND_ROBIN_PERSONAS {
            return Err(Error::bad_request("At least two personas are required"));
        }
        if count > MAX_ROUND_ROBIN_PERSONAS {
            return Err(Error::bad_request(format!(
                "At most {} personas are supported",
                MAX_ROUND_ROBIN_PERSONAS
            )));
        }
        if plan.selected_personas.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::bad_request("Persona name is required"));
        }

        let claim = plan.claim.trim();
        if claim.is_empty() {
            return Err(Error::bad_request("A claim is required"));
        }

        let iterations = self.check_iterations(plan.iterations, DEFAULT_ROUND_ROBIN_ITERATIONS)?;

        Ok(RoundRobinRequest {
            selected_personas: plan.selected_personas.clone(),
            claim: claim.to_string(),
            iterations,
        })
    }

    fn check_iterations(&self, requested: Option<i64>, default: u32) -> Result<u32> {
        let Some(n) = requested else {
            return Ok(default.min(self.max_iterations));
        };
        if n <= 0 {
            return Err(Error::bad_request("'iterations' must be a positive integer"));
        }
        if n > i64::from(self.max_iterations) {
            return Err(Error::bad_request(format!(
                "'iterations' must not exceed {}",
                self.max_iterations
            )));
        }
        Ok(n as u32)
    }
}

/// Names recorded for the two slots. When both slots speak as the same
/// persona the turns are labelled `<name> (1)` and `<name> (2)`.
fn slot_labels(persona_1: &str, persona_2: &str) -> [String; 2] {
    if persona_1 == persona_2 {
        [format!("{} (1)", persona_1), format!("{} (2)", persona_2)]
    } else {
        [persona_1.to_string(), persona_2.to_string()]
    }
}
