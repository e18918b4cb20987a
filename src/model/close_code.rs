//! Close codes issued by the voice gateway, and their resume semantics.

/// Websocket close code sent by the voice gateway.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CloseCode {
    /// An invalid opcode was sent.
    UnknownOpcode = 4001,
    /// An invalid payload was sent.
    FailedToDecode = 4002,
    /// A payload was sent before identifying.
    NotAuthenticated = 4003,
    /// The token used to identify was invalid.
    AuthenticationFailed = 4004,
    /// More than one identify was sent on the same socket.
    AlreadyAuthenticated = 4005,
    /// The session is no longer valid.
    SessionInvalid = 4006,
    /// The session timed out.
    SessionTimeout = 4009,
    /// The requested voice server could not be found.
    ServerNotFound = 4011,
    /// An unrecognised protocol was selected.
    UnknownProtocol = 4012,
    /// The client was disconnected (channel deleted, kicked, ...).
    Disconnected = 4014,
    /// The voice server crashed; clients should resume.
    VoiceServerCrashed = 4015,
    /// An unrecognised encryption mode was selected.
    UnknownEncryptionMode = 4016,
}

impl CloseCode {
    /// Maps a raw wire value onto a close code, if known.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            4001 => Self::UnknownOpcode,
            4002 => Self::FailedToDecode,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4006 => Self::SessionInvalid,
            4009 => Self::SessionTimeout,
            4011 => Self::ServerNotFound,
            4012 => Self::UnknownProtocol,
            4014 => Self::Disconnected,
            4015 => Self::VoiceServerCrashed,
            4016 => Self::UnknownEncryptionMode,
            _ => return None,
        })
    }

    /// Whether a session closed with this code may be re-attached via resume.
    ///
    /// The remaining codes indicate the server no longer holds (or refuses to
    /// hold) session state, so the only way forward is a fresh identify on a
    /// brand new session, if at all.
    #[must_use]
    pub fn should_resume(self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed
                | Self::SessionInvalid
                | Self::SessionTimeout
                | Self::ServerNotFound
                | Self::UnknownProtocol
                | Self::Disconnected
                | Self::UnknownEncryptionMode
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn critical_codes_forbid_resume() {
        for raw in [4004, 4006, 4009, 4011, 4012, 4014, 4016] {
            let code = CloseCode::from_u16(raw).unwrap();
            assert!(!code.should_resume(), "{raw} must not resume");
        }
    }

    #[test]
    fn transient_codes_allow_resume() {
        for raw in [4001, 4002, 4003, 4005, 4015] {
            let code = CloseCode::from_u16(raw).unwrap();
            assert!(code.should_resume(), "{raw} should resume");
        }
    }

    #[test]
    fn unknown_codes_are_none() {
        assert_eq!(CloseCode::from_u16(1000), None);
        assert_eq!(CloseCode::from_u16(4999), None);
    }
}
