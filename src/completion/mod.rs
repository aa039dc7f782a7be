//! Completion backends
//!
//! The completion service generates every agent message. This module
//! defines the contract the orchestrator depends on, the HTTP client used in
//! production and a scriptable mock for tests.

mod http;
mod mock;
mod traits;

pub use http::{HttpCompletionBackend, NO_RESPONSE_TEXT};
pub use mock::{MockCompletionBackend, MockCompletionConfig};
pub use traits::{
    CompletionBackend, CompletionRequest, ConversationTurn, RoundRobinRequest, SharedCompletion,
};
