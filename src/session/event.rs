//! Events that drive the session lifecycle

use super::state::Operation;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    /// A browsing context was launched
    ContextAcquired,
    Authenticated,
    BeginOperation(Operation),
    OperationFinished,
    Fault {
        kind: ErrorKind,
        message: String,
    },
    Close,
    /// The browsing context has been released
    Released,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::ContextAcquired => "context_acquired",
            Event::Authenticated => "authenticated",
            Event::BeginOperation(_) => "begin_operation",
            Event::OperationFinished => "operation_finished",
            Event::Fault { .. } => "fault",
            Event::Close => "close",
            Event::Released => "released",
        }
    }
}
