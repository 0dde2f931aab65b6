//! Property-based tests for the session state machine

use super::*;
use crate::error::ErrorKind;
use proptest::prelude::*;

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Chat),
        Just(Operation::AskWithFile),
        Just(Operation::Download),
    ]
}

fn arb_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Environment),
        Just(ErrorKind::Authentication),
        Just(ErrorKind::MfaTimeout),
        Just(ErrorKind::Automation),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Start),
        Just(Event::ContextAcquired),
        Just(Event::Authenticated),
        arb_operation().prop_map(Event::BeginOperation),
        Just(Event::OperationFinished),
        (arb_error_kind(), "[a-z ]{0,12}").prop_map(|(kind, message)| Event::Fault { kind, message }),
        Just(Event::Close),
        Just(Event::Released),
    ]
}

fn arb_state() -> impl Strategy<Value = SessionState> {
    prop_oneof![
        Just(SessionState::Unstarted),
        Just(SessionState::Starting),
        Just(SessionState::Authenticating),
        Just(SessionState::Ready),
        arb_operation().prop_map(|operation| SessionState::Busy { operation }),
        Just(SessionState::Closing),
        Just(SessionState::Closed),
        (arb_error_kind(), "[a-z ]{0,12}")
            .prop_map(|(kind, message)| SessionState::Error { kind, message }),
    ]
}

proptest! {
    #[test]
    fn prop_close_accepted_from_every_state(state in arb_state()) {
        let next = transition(&state, Event::Close);
        prop_assert!(next.is_ok());
        prop_assert!(next.unwrap().is_shutting_down());
    }

    #[test]
    fn prop_error_only_leads_to_closing(
        kind in arb_error_kind(),
        event in arb_event(),
    ) {
        let state = SessionState::Error { kind, message: "x".to_string() };
        match transition(&state, event.clone()) {
            Ok(next) => {
                prop_assert_eq!(event, Event::Close);
                prop_assert_eq!(next, SessionState::Closing);
            }
            Err(_) => prop_assert_ne!(event, Event::Close),
        }
    }

    #[test]
    fn prop_busy_entered_only_from_ready(state in arb_state(), event in arb_event()) {
        if let Ok(SessionState::Busy { .. }) = transition(&state, event.clone()) {
            prop_assert_eq!(state, SessionState::Ready);
            prop_assert!(matches!(event, Event::BeginOperation(_)));
        }
    }

    #[test]
    fn prop_closed_is_absorbing(event in arb_event()) {
        if let Ok(next) = transition(&SessionState::Closed, event) {
            prop_assert_eq!(next, SessionState::Closed);
        }
    }

    #[test]
    fn prop_rejections_are_pure(state in arb_state(), event in arb_event()) {
        prop_assert_eq!(
            transition(&state, event.clone()),
            transition(&state, event)
        );
    }

    #[test]
    fn prop_random_walk_keeps_invariants(events in prop::collection::vec(arb_event(), 0..40)) {
        let mut session = Session::new(&crate::config::Settings::default());
        let mut was_closing = false;
        for event in events {
            let before = session.state().clone();
            match session.apply(event).cloned() {
                Ok(after) => {
                    if after == SessionState::Closed && before != SessionState::Closed {
                        prop_assert_eq!(&before, &SessionState::Closing);
                    }
                    if matches!(after, SessionState::Ready) {
                        let came_from_auth_or_busy = matches!(
                            before,
                            SessionState::Authenticating | SessionState::Busy { .. }
                        );
                        prop_assert!(came_from_auth_or_busy);
                    }
                }
                Err(_) => prop_assert_eq!(session.state(), &before),
            }
            if session.state().is_shutting_down() {
                was_closing = true;
            }
            if was_closing {
                prop_assert!(session.state().is_shutting_down());
            }
        }
    }
}
