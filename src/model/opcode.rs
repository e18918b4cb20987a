//! Opcodes used by the voice gateway.

/// Operation code attached to every voice gateway frame.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Opcode {
    /// Client's first frame on a fresh session, bearing auth data.
    Identify = 0,
    /// Client's transport selection once UDP discovery has finished.
    SelectProtocol = 1,
    /// Server handoff of SSRC, UDP endpoint, and offered encryption modes.
    Ready = 2,
    /// Periodic client keepalive over the control channel.
    Heartbeat = 3,
    /// Server delivery of the negotiated mode and secret key.
    SessionDescription = 4,
    /// Speaking-state change, sent by either side.
    Speaking = 5,
    /// Server acknowledgement of a heartbeat.
    HeartbeatAck = 6,
    /// Client re-attach to an existing session after a dropped socket.
    Resume = 7,
    /// Server's first frame, bearing the heartbeat interval.
    Hello = 8,
    /// Server confirmation of a successful resume.
    Resumed = 9,
    /// One or more clients joined the channel.
    ClientsConnect = 11,
    /// A client left the channel.
    ClientDisconnect = 13,
    /// E2EE overlay: a protocol transition is pending.
    DavePrepareTransition = 21,
    /// E2EE overlay: execute a previously announced transition.
    DaveExecuteTransition = 22,
    /// E2EE overlay: client readiness for a pending transition.
    DaveTransitionReady = 23,
    /// E2EE overlay: protocol version change for an upcoming epoch.
    DavePrepareEpoch = 24,
    /// E2EE overlay: MLS external sender credentials (binary).
    DaveMlsExternalSender = 25,
    /// E2EE overlay: MLS key package (binary).
    DaveMlsKeyPackage = 26,
    /// E2EE overlay: MLS proposals (binary).
    DaveMlsProposals = 27,
    /// E2EE overlay: MLS commit/welcome bundle (binary).
    DaveMlsCommitWelcome = 28,
    /// E2EE overlay: commit announcement for a transition (binary).
    DaveMlsAnnounceCommitTransition = 29,
    /// E2EE overlay: MLS welcome for a transition (binary).
    DaveMlsWelcome = 30,
    /// E2EE overlay: a commit or welcome was rejected (binary).
    DaveMlsInvalidCommitWelcome = 31,
}

impl Opcode {
    /// Maps a raw wire value onto an opcode, if known.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Identify,
            1 => Self::SelectProtocol,
            2 => Self::Ready,
            3 => Self::Heartbeat,
            4 => Self::SessionDescription,
            5 => Self::Speaking,
            6 => Self::HeartbeatAck,
            7 => Self::Resume,
            8 => Self::Hello,
            9 => Self::Resumed,
            11 => Self::ClientsConnect,
            13 => Self::ClientDisconnect,
            21 => Self::DavePrepareTransition,
            22 => Self::DaveExecuteTransition,
            23 => Self::DaveTransitionReady,
            24 => Self::DavePrepareEpoch,
            25 => Self::DaveMlsExternalSender,
            26 => Self::DaveMlsKeyPackage,
            27 => Self::DaveMlsProposals,
            28 => Self::DaveMlsCommitWelcome,
            29 => Self::DaveMlsAnnounceCommitTransition,
            30 => Self::DaveMlsWelcome,
            31 => Self::DaveMlsInvalidCommitWelcome,
            _ => return None,
        })
    }

    /// Whether this opcode belongs to the E2EE media overlay.
    #[must_use]
    pub fn is_dave(self) -> bool {
        (self as u8) >= 21
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for raw in 0..=40u8 {
            if let Some(op) = Opcode::from_u8(raw) {
                assert_eq!(op as u8, raw);
            }
        }
        assert_eq!(Opcode::from_u8(10), None);
        assert_eq!(Opcode::from_u8(12), None);
    }

    #[test]
    fn dave_range() {
        assert!(Opcode::DavePrepareTransition.is_dave());
        assert!(Opcode::DaveMlsInvalidCommitWelcome.is_dave());
        assert!(!Opcode::Speaking.is_dave());
    }
}
