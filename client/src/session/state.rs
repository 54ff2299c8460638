//! Session phase state machine

use super::SessionError;
use crate::testing::PhaseKind;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Probing,
    Downloading,
    Uploading,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    PhaseCompleted,
    AggregationDone,
    Fail,
    Cancel,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Measurement phase running in this state
    pub fn phase(self) -> Option<PhaseKind> {
        match self {
            SessionState::Probing => Some(PhaseKind::Latency),
            SessionState::Downloading => Some(PhaseKind::Download),
            SessionState::Uploading => Some(PhaseKind::Upload),
            _ => None,
        }
    }

    /// Position in the fixed phase order, used for overall progress
    pub(crate) fn ordinal(self) -> usize {
        match self {
            SessionState::Idle => 0,
            SessionState::Probing => 0,
            SessionState::Downloading => 1,
            SessionState::Uploading => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Probing => "probing",
            SessionState::Downloading => "downloading",
            SessionState::Uploading => "uploading",
            SessionState::Aggregating => "aggregating",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Next state for `event` in `from`; every pair not listed is rejected
pub fn transition(from: SessionState, event: SessionEvent) -> Result<SessionState, SessionError> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (from, event) {
        (S::Idle, E::Start) => S::Probing,

        (S::Probing, E::PhaseCompleted) => S::Downloading,
        (S::Downloading, E::PhaseCompleted) => S::Uploading,
        (S::Uploading, E::PhaseCompleted) => S::Aggregating,

        (S::Aggregating, E::AggregationDone) => S::Completed,

        (state, E::Fail) if !state.is_terminal() => S::Failed,
        (state, E::Cancel) if !state.is_terminal() => S::Cancelled,

        _ => return Err(SessionError::InvalidTransition { from, event }),
    };
    Ok(next)
}
