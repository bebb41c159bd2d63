//! Session state machine and statistics.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::time::Instant;

/// State of a client session.
///
/// ```text
/// Idle -> TimestampCaptured -> Selecting -> Selected -> Applying -> Applied
///   \______________\_______________\___________\____________\----> Failed
/// Applied | Failed -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session running.
    Idle,
    /// The local timestamp bounding the upload was captured.
    TimestampCaptured,
    /// Local changes are being selected.
    Selecting,
    /// Local changes are selected and being exchanged.
    Selected,
    /// Server changes are being applied.
    Applying,
    /// The session completed and watermarks advanced.
    Applied,
    /// The session failed; watermarks are unchanged.
    Failed,
}

impl SessionState {
    /// Returns true if a session is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::TimestampCaptured
                | SessionState::Selecting
                | SessionState::Selected
                | SessionState::Applying
        )
    }

    /// Returns true if a new session can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Applied | SessionState::Failed
        )
    }

    /// Returns true if `next` may follow this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, TimestampCaptured)
            | (TimestampCaptured, Selecting)
            | (Selecting, Selected)
            | (Selected, Applying)
            | (Applying, Applied)
            | (Applied, Idle)
            | (Failed, Idle) => true,
            (current, Failed) => current.is_active() || *current == Idle,
            _ => false,
        }
    }

    /// Moves to `next`, rejecting transitions outside the session order.
    pub fn transition(&mut self, next: SessionState) -> SyncResult<()> {
        if !self.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Statistics about sync sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed.
    pub sessions_failed: u64,
    /// Rows selected and uploaded.
    pub rows_uploaded: u64,
    /// Rows received from the server.
    pub rows_downloaded: u64,
    /// Conflicts resolved on both sides.
    pub conflicts_resolved: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_properties() {
        assert!(SessionState::Idle.can_start_sync());
        assert!(SessionState::Applied.can_start_sync());
        assert!(SessionState::Failed.can_start_sync());
        assert!(!SessionState::Selecting.can_start_sync());

        assert!(SessionState::Applying.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Applied.is_active());
    }

    #[test]
    fn full_session_path() {
        let mut state = SessionState::Idle;
        for next in [
            SessionState::TimestampCaptured,
            SessionState::Selecting,
            SessionState::Selected,
            SessionState::Applying,
            SessionState::Applied,
            SessionState::Idle,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, SessionState::Idle);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut state = SessionState::Idle;
        let err = state.transition(SessionState::Applying).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert_eq!(state, SessionState::Idle);

        state.transition(SessionState::TimestampCaptured).unwrap();
        state.transition(SessionState::Failed).unwrap();
        assert!(state.transition(SessionState::Failed).is_err());
        state.transition(SessionState::Idle).unwrap();
    }
}
