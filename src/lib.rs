//! persona-relay - WebSocket session relay between users and LLM personas
//!
//! Users connect to `/ws/llm/{persona}?token=...`, are admitted through the
//! identity gate and persona directory, join a broadcast group and exchange
//! messages with a remote completion service. Agent-to-agent exchanges are
//! driven by the turn orchestrator. Every message is appended to the
//! conversation log.

pub mod cli;
pub mod completion;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod persona;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod version;

pub use error::{Error, Result};
