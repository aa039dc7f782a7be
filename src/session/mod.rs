//! Connection sessions
//!
//! One session per WebSocket connection:
//! - admission: token, persona name from the path, persona binding
//! - group membership for the lifetime of the connection
//! - sequential dispatch of inbound frames to the turn orchestrator
//!
//! How personas are bound and whether completions run at all is chosen by
//! [`SessionStrategy`].

mod admission;
mod connection;
mod dispatch;
mod state;

pub use admission::{admit, Admission, ConnectTarget};
pub use connection::serve_connection;
pub use dispatch::Session;
pub use state::SessionState;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SessionSettings;
use crate::identity::SharedIdentityGate;
use crate::orchestrator::TurnOrchestrator;
use crate::persona::PersonaDirectory;
use crate::router::GroupRouter;
use crate::store::SharedMessageLog;

// ─────────────────────────────────────────────────────────────────
// Strategy & Scope
// ─────────────────────────────────────────────────────────────────

/// How a session binds its persona and handles requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// Persona must already exist (any owner); nothing is created
    StrictPersonaValidation,
    /// Persona is looked up or created for the connecting user
    #[default]
    UserScopedAutocreate,
    /// Like autocreate, but messages are echoed without a completion call
    EchoOnlyStub,
}

impl SessionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStrategy::StrictPersonaValidation => "strict_persona_validation",
            SessionStrategy::UserScopedAutocreate => "user_scoped_autocreate",
            SessionStrategy::EchoOnlyStub => "echo_only_stub",
        }
    }
}

impl fmt::Display for SessionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict_persona_validation" | "strict" => Ok(SessionStrategy::StrictPersonaValidation),
            "user_scoped_autocreate" | "autocreate" => Ok(SessionStrategy::UserScopedAutocreate),
            "echo_only_stub" | "echo" => Ok(SessionStrategy::EchoOnlyStub),
            other => Err(format!("unknown session strategy '{}'", other)),
        }
    }
}

/// Which connections share a broadcast group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupScope {
    /// One group per persona and user
    #[default]
    PersonaUser,
    /// One group per persona name
    Persona,
}

impl FromStr for GroupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "persona_user" => Ok(GroupScope::PersonaUser),
            "persona" => Ok(GroupScope::Persona),
            other => Err(format!("unknown group scope '{}'", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared Context
// ─────────────────────────────────────────────────────────────────

/// Collaborators shared by every session of a server
pub struct SessionContext {
    pub identity: SharedIdentityGate,
    pub directory: Arc<PersonaDirectory>,
    pub router: Arc<GroupRouter>,
    pub log: SharedMessageLog,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub settings: SessionSettings,
    /// Path prefix in front of the persona name
    pub route_prefix: String,
    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "strict_persona_validation".parse::<SessionStrategy>().unwrap(),
            SessionStrategy::StrictPersonaValidation
        );
        assert_eq!("ECHO".parse::<SessionStrategy>().unwrap(), SessionStrategy::EchoOnlyStub);
        assert!("sometimes".parse::<SessionStrategy>().is_err());

        for strategy in [
            SessionStrategy::StrictPersonaValidation,
            SessionStrategy::UserScopedAutocreate,
            SessionStrategy::EchoOnlyStub,
        ] {
            assert_eq!(strategy.to_string().parse::<SessionStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("persona".parse::<GroupScope>().unwrap(), GroupScope::Persona);
        assert_eq!("persona_user".parse::<GroupScope>().unwrap(), GroupScope::PersonaUser);
        assert!("global".parse::<GroupScope>().is_err());
    }
}
