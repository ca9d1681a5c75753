use crate::error::{self, Result};

use serde::Serialize;
use std::fmt;

/// The lifecycle phase of a quarantine request while the controller works on it.
///
/// Phases only move along the edges accepted by [`QuarantineState::transition`]; anything else is rejected
/// rather than silently applied.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum QuarantineState {
    Idle,
    Preparing,
    Active,
    Updating,
    Stopped,
}

impl QuarantineState {
    /// The phase a freshly loaded request starts in, based on its persisted active condition.
    pub fn from_active(is_active: bool) -> Self {
        if is_active {
            QuarantineState::Active
        } else {
            QuarantineState::Idle
        }
    }

    fn allows(self, next: QuarantineState) -> bool {
        use QuarantineState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Active)
                | (Active, Updating)
                | (Updating, Active)
                | (Idle, Stopped)
                | (Preparing, Stopped)
                | (Active, Stopped)
                | (Updating, Stopped)
        )
    }

    /// Returns the next phase, or `InvalidTransition` if the move is not allowed from this phase.
    pub fn transition(self, next: QuarantineState) -> Result<QuarantineState> {
        if self.allows(next) {
            Ok(next)
        } else {
            error::InvalidTransitionSnafu {
                from: self,
                to: next,
            }
            .fail()
        }
    }
}

impl fmt::Display for QuarantineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        serde_plain::to_string(self)
            .map_err(|_| fmt::Error)
            .and_then(|s| f.write_str(&s))
    }
}
