//! Session lifecycle state

use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Upgraded, not yet authenticated
    #[default]
    Pending,
    /// User and persona bound, not yet in a group
    Admitted,
    /// Group joined; frames are dispatched
    Active,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Admitted => "admitted",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, next),
            (Pending, Admitted) | (Admitted, Active) | (Pending | Admitted | Active, Closed)
        )
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid session transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
