//! Observable lifecycle states of a voice session.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

/// Lifecycle of one per-guild voice session.
///
/// Audio may only flow in [`Ready`]; [`Closed`] is terminal for the session
/// (a fresh `connect` begins a new one).
///
/// [`Ready`]: Self::Ready
/// [`Closed`]: Self::Closed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[non_exhaustive]
pub enum SessionState {
    /// No join has been requested.
    Idle = 0,
    /// A join was requested; waiting on the main gateway's state/server
    /// updates.
    AwaitingServer = 1,
    /// Dialling the voice websocket.
    Connecting = 2,
    /// HELLO received; identify/resume sent.
    Identifying = 3,
    /// Waiting on READY (SSRC, UDP endpoint, mode offer).
    AwaitingReady = 4,
    /// UDP discovery done; waiting on the session description and key.
    AwaitingDescription = 5,
    /// Keys installed, UDP bound: audio may flow.
    Ready = 6,
    /// A recoverable fault occurred; redialling after backoff.
    Reconnecting = 7,
    /// The session ended and cannot be resumed.
    Closed = 8,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::AwaitingServer,
            2 => Self::Connecting,
            3 => Self::Identifying,
            4 => Self::AwaitingReady,
            5 => Self::AwaitingDescription,
            6 => Self::Ready,
            7 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

/// Shared, lock-free view of a session's current state.
///
/// Transitions are only ever written by the supervisor task; everything else
/// (the public handle, tests) reads.
#[derive(Clone, Debug)]
pub(crate) struct StateFlag(Arc<AtomicU8>);

impl StateFlag {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Idle as u8)))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_round_trips_all_states() {
        let flag = StateFlag::new();
        assert_eq!(flag.get(), SessionState::Idle);

        for state in [
            SessionState::AwaitingServer,
            SessionState::Connecting,
            SessionState::Identifying,
            SessionState::AwaitingReady,
            SessionState::AwaitingDescription,
            SessionState::Ready,
            SessionState::Reconnecting,
            SessionState::Closed,
        ] {
            flag.set(state);
            assert_eq!(flag.get(), state);
        }
    }
}
