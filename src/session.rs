//! Session lifecycle state machine
//!
//! The controller never mutates its state directly: every change goes
//! through the pure [`transition`] function, so illegal orderings (a chat
//! before authentication, anything but `close` after a fault) are rejected
//! in one place.

mod event;
#[cfg(test)]
mod proptests;
mod state;
mod transition;

pub use event::Event;
pub use state::{Operation, SessionState};
pub use transition::{transition, TransitionError};

use crate::config::Settings;
use std::path::PathBuf;

/// One logical browsing session, owned by a single controller.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    pub storage_state_path: PathBuf,
    pub headless: bool,
    pub base_url: String,
}

impl Session {
    pub fn new(settings: &Settings) -> Self {
        Self {
            state: SessionState::Unstarted,
            storage_state_path: settings.storage_state_path.clone(),
            headless: settings.headless,
            base_url: settings.base_url.clone(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Runs `event` through the state machine and records the new state.
    pub fn apply(&mut self, event: Event) -> Result<&SessionState, TransitionError> {
        let event_name = event.name();
        let next = transition(&self.state, event)?;
        if next != self.state {
            tracing::info!(
                from = %self.state,
                to = %next,
                event = event_name,
                "Session state changed"
            );
        }
        self.state = next;
        Ok(&self.state)
    }
}
