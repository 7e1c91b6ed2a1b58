//! Forward-only state machine of one upload.

use std::fmt;

use crate::error::FlashError;

/// Stage of the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    #[default]
    Start,
    /// Comparing the image against current device contents.
    Compare,
    BackupNvm,
    Erase,
    Program,
    RestoreNvm,
    /// Comparing again after programming.
    Verify,
    Reset,
    Done,
    Aborted,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Start => write!(f, "START"),
            UploadState::Compare => write!(f, "COMPARE"),
            UploadState::BackupNvm => write!(f, "BACKUP_NVM"),
            UploadState::Erase => write!(f, "ERASE"),
            UploadState::Program => write!(f, "PROGRAM"),
            UploadState::RestoreNvm => write!(f, "RESTORE_NVM"),
            UploadState::Verify => write!(f, "VERIFY"),
            UploadState::Reset => write!(f, "RESET"),
            UploadState::Done => write!(f, "DONE"),
            UploadState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Aborted)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;

        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Start, Compare)
                | (Start, BackupNvm)
                | (Compare, BackupNvm)
                | (Compare, Done)
                | (BackupNvm, Erase)
                | (Erase, Program)
                | (Program, RestoreNvm)
                | (RestoreNvm, Verify)
                | (Verify, Reset)
                | (Verify, Done)
                | (Reset, Done)
        )
    }
}

/// Tracks the current state and rejects backward or skipping transitions.
#[derive(Debug, Default)]
pub struct UploadMachine {
    state: UploadState,
    /// State in which the machine was aborted, if it was.
    aborted_in: Option<UploadState>,
}

impl UploadMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn aborted_in(&self) -> Option<UploadState> {
        self.aborted_in
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, next: UploadState) -> Result<UploadState, FlashError> {
        if !self.state.can_transition_to(next) {
            return Err(FlashError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "State transition");
        let from = self.state;
        if next == UploadState::Aborted {
            self.aborted_in = Some(from);
        }
        self.state = next;
        Ok(from)
    }
}
