//! Session state types

use crate::error::ErrorKind;
use serde::Serialize;
use std::fmt;

/// Work a busy session is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Chat,
    AskWithFile,
    Download,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::AskWithFile => "ask_with_file",
            Operation::Download => "download",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unstarted,
    Starting,
    Authenticating,
    Ready,
    Busy {
        operation: Operation,
    },
    Closing,
    Closed,
    /// Unrecoverable failure; only `close` is accepted from here
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Starting => "starting",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Busy { .. } => "busy",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Closing or closed
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Busy { operation } => write!(f, "busy ({operation})"),
            SessionState::Error { kind, .. } => write!(f, "error ({kind:?})"),
            other => f.write_str(other.name()),
        }
    }
}
