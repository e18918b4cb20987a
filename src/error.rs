//! Session and playback error handling.

use std::{error::Error, fmt, io::Error as IoError};

/// Error returned when a call handler cannot join, or stay joined to,
/// a voice channel.
#[derive(Debug)]
#[non_exhaustive]
pub enum JoinError {
    /// Request to join was dropped, cancelled, or replaced.
    Dropped,
    /// No gateway sender was configured to carry voice state updates.
    NoSender,
    /// Tried to leave a call which was not found.
    NoCall,
    /// This guild already has a live voice session.
    ///
    /// A session must be closed before a second join may begin.
    AlreadyJoined,
    /// Connection details were not received from the gateway in the
    /// configured deadline.
    ///
    /// This can occur if a message is lost between client restarts, or if
    /// the gateway believes this bot is still in the channel it attempts
    /// to join.
    TimedOut,
    /// The driver failed to establish a voice connection.
    Driver(ConnectionError),
}

impl JoinError {
    /// Indicates whether this failure may have left the gateway state for
    /// this guild inconsistent, such that the caller should `leave` before
    /// rejoining.
    #[must_use]
    pub fn should_leave_server(&self) -> bool {
        matches!(self, JoinError::TimedOut)
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to join voice channel: ")?;
        match self {
            JoinError::Dropped => write!(f, "request was cancelled/dropped"),
            JoinError::NoSender => write!(f, "no gateway destination"),
            JoinError::NoCall => write!(f, "tried to leave a non-existent call"),
            JoinError::AlreadyJoined => write!(f, "a session is already live for this guild"),
            JoinError::TimedOut => write!(f, "gateway response timed out"),
            JoinError::Driver(_) => write!(f, "establishing connection failed"),
        }
    }
}

impl Error for JoinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JoinError::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for JoinError {
    fn from(e: ConnectionError) -> Self {
        JoinError::Driver(e)
    }
}

/// Convenience type for join error handling.
pub type JoinResult<T> = Result<T, JoinError>;

/// Error returned when audio transmission cannot start or continue.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlayError {
    /// A transmission is already active on this session.
    AlreadyPlaying,
    /// The transcoder executable could not be resolved on `PATH`.
    TranscoderMissing(String),
    /// The transcoder subprocess could not be spawned or piped.
    Io(IoError),
    /// No session is live to carry audio.
    NotConnected,
    /// The driver's control task has shut down.
    Dropped,
}

impl fmt::Display for PlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to play audio: ")?;
        match self {
            PlayError::AlreadyPlaying => write!(f, "a transmission is already active"),
            PlayError::TranscoderMissing(name) => {
                write!(f, "transcoder executable {name:?} not found on PATH")
            },
            PlayError::Io(e) => e.fmt(f),
            PlayError::NotConnected => write!(f, "no live voice session"),
            PlayError::Dropped => write!(f, "driver terminated"),
        }
    }
}

impl Error for PlayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PlayError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for PlayError {
    fn from(e: IoError) -> Self {
        PlayError::Io(e)
    }
}

/// Convenience type for playback error handling.
pub type PlayResult<T> = Result<T, PlayError>;

pub use crate::driver::connection::error::{Error as ConnectionError, Result as ConnectionResult};
