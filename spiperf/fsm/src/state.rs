// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::errors::Error;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

/// The states a session state machine moves through. Transitions are
/// one-way between adjacent states, except that the server loops from
/// cleanup back to connect after non-fatal errors. The `Error` state is
/// entered only by the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum State {
    Connect = 0,
    Configure = 1,
    Ready = 2,
    Armed = 3,
    Running = 4,
    Done = 5,
    Cleanup = 6,
    Error = 7,
}

impl State {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => State::Connect,
            1 => State::Configure,
            2 => State::Ready,
            3 => State::Armed,
            4 => State::Running,
            5 => State::Done,
            6 => State::Cleanup,
            _ => State::Error,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Connect => "connect",
            State::Configure => "configure",
            State::Ready => "ready",
            State::Armed => "armed",
            State::Running => "running",
            State::Done => "done",
            State::Cleanup => "cleanup",
            State::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Lock-free slot publishing a state machine's current state. The owning
/// state machine is the only writer; any task may read concurrently.
#[derive(Clone, Debug)]
pub struct StateHandle {
    label: Arc<AtomicU8>,
}

impl StateHandle {
    pub(crate) fn new() -> Self {
        Self {
            label: Arc::new(AtomicU8::new(State::Connect as u8)),
        }
    }

    /// Returns the most recently published state.
    pub fn get(&self) -> State {
        State::from_raw(self.label.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: State) {
        self.label.store(state as u8, Ordering::Release);
    }
}

/// Outcome of one state function: the next state to enter (`None`
/// terminates the machine) plus the error to record, if any.
pub(crate) type StepOutcome = (Option<State>, Result<(), Error>);

pub(crate) fn proceed(state: State) -> StepOutcome {
    (Some(state), Ok(()))
}

pub(crate) fn finished() -> StepOutcome {
    (None, Ok(()))
}

pub(crate) fn fail(error: Error) -> StepOutcome {
    (None, Err(error))
}

pub(crate) fn cleanup() -> StepOutcome {
    (Some(State::Cleanup), Ok(()))
}

pub(crate) fn cleanup_with(error: Error) -> StepOutcome {
    (Some(State::Cleanup), Err(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels_round_trip_through_the_handle() {
        let handle = StateHandle::new();
        assert_eq!(handle.get(), State::Connect);

        for state in [
            State::Configure,
            State::Ready,
            State::Armed,
            State::Running,
            State::Done,
            State::Cleanup,
            State::Error,
        ] {
            handle.set(state);
            assert_eq!(handle.get(), state);
            assert_eq!(handle.clone().get(), state);
        }
    }

    #[test]
    fn test_state_display_is_lowercase() {
        assert_eq!(State::Connect.to_string(), "connect");
        assert_eq!(State::Cleanup.to_string(), "cleanup");
    }
}
