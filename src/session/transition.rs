//! Pure state transition function

use super::{Event, Operation, SessionState};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Session is busy with {0} (wait for it to finish)")]
    Busy(Operation),
    #[error("Invalid transition: {event} while {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
}

/// Computes the state that follows `state` on `event`.
///
/// Pure: no I/O, same inputs always give the same output.
pub fn transition(state: &SessionState, event: Event) -> Result<SessionState, TransitionError> {
    match (state, event) {
        // Close is accepted everywhere and is idempotent
        (SessionState::Closed, Event::Close) => Ok(SessionState::Closed),
        (_, Event::Close) => Ok(SessionState::Closing),
        (SessionState::Closing, Event::Released) => Ok(SessionState::Closed),

        // Startup
        (SessionState::Unstarted, Event::Start) => Ok(SessionState::Starting),
        (SessionState::Starting, Event::ContextAcquired) => Ok(SessionState::Authenticating),
        (SessionState::Authenticating, Event::Authenticated) => Ok(SessionState::Ready),

        // Operations
        (SessionState::Ready, Event::BeginOperation(operation)) => {
            Ok(SessionState::Busy { operation })
        }
        (SessionState::Busy { operation }, Event::BeginOperation(_)) => {
            Err(TransitionError::Busy(*operation))
        }
        (SessionState::Busy { .. }, Event::OperationFinished) => Ok(SessionState::Ready),

        // Faults from any live state; an errored session only accepts Close
        (
            SessionState::Error { .. } | SessionState::Closing | SessionState::Closed,
            event @ Event::Fault { .. },
        ) => Err(invalid(state, &event)),
        (_, Event::Fault { kind, message }) => Ok(SessionState::Error { kind, message }),

        (_, event) => Err(invalid(state, &event)),
    }
}

fn invalid(state: &SessionState, event: &Event) -> TransitionError {
    TransitionError::InvalidTransition {
        from: state.name(),
        event: event.name(),
    }
}
