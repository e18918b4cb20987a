//! Extension point for the opt-in end-to-end media encryption overlay.
//!
//! The voice gateway gates session liveness on overlay control traffic even
//! for clients which do not participate: transition announcements must be
//! acknowledged or the server drops the session. Media stays under the
//! transport-mode AEAD whenever the negotiated overlay version is 0.

use tracing::{debug, info};

/// Hooks invoked by the websocket task when overlay traffic arrives.
///
/// Implementations own any group-encryption state; the bundled
/// [`Passthrough`] stays at protocol version 0 and only keeps the session
/// alive.
pub trait MediaSecurityOverlay: Send {
    /// Highest overlay protocol version to advertise during identify.
    fn max_protocol_version(&self) -> u16;

    /// A transition to `protocol_version` was announced. Returning `true`
    /// asks the gateway task to acknowledge readiness for `transition_id`.
    fn prepare_transition(&mut self, transition_id: u16, protocol_version: u16) -> bool;

    /// The server executed a previously announced transition.
    fn execute_transition(&mut self, transition_id: u16);

    /// Inbound MLS credential/key material (external sender, key packages,
    /// proposals).
    fn process_key_package(&mut self, payload: &[u8]);

    /// Inbound MLS commit or welcome material. Returns the transition id to
    /// acknowledge, if any.
    fn process_commit_welcome(&mut self, payload: &[u8]) -> Option<u16>;
}

/// Overlay stub for protocol version 0: no end-to-end encryption.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough {
    protocol_version: u16,
    pending: Option<(u16, u16)>,
}

impl MediaSecurityOverlay for Passthrough {
    fn max_protocol_version(&self) -> u16 {
        0
    }

    fn prepare_transition(&mut self, transition_id: u16, protocol_version: u16) -> bool {
        // Transition 0 is an immediate downgrade back to passthrough media:
        // it executes at once and wants no readiness frame.
        if transition_id == 0 {
            self.protocol_version = protocol_version;
            return false;
        }

        self.pending = Some((transition_id, protocol_version));
        true
    }

    fn execute_transition(&mut self, transition_id: u16) {
        if let Some((pending_id, version)) = self.pending.take() {
            if pending_id == transition_id {
                self.protocol_version = version;
                info!(
                    "overlay transition {} executed, protocol version now {}",
                    transition_id, version
                );
                return;
            }
            self.pending = Some((pending_id, version));
        }

        debug!("overlay transition {} had no pending entry", transition_id);
    }

    fn process_key_package(&mut self, payload: &[u8]) {
        debug!("ignoring {} bytes of MLS material in passthrough mode", payload.len());
    }

    fn process_commit_welcome(&mut self, payload: &[u8]) -> Option<u16> {
        // Commit/welcome payloads open with the transition they belong to.
        if payload.len() < 2 {
            return None;
        }

        let transition_id = u16::from_be_bytes([payload[0], payload[1]]);
        (transition_id != 0).then_some(transition_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonzero_transitions_are_acknowledged() {
        let mut overlay = Passthrough::default();
        assert!(overlay.prepare_transition(3, 1));
        overlay.execute_transition(3);
        assert_eq!(overlay.protocol_version, 1);
    }

    #[test]
    fn transition_zero_executes_immediately() {
        let mut overlay = Passthrough::default();
        assert!(!overlay.prepare_transition(0, 0));
        assert_eq!(overlay.pending, None);
    }

    #[test]
    fn commit_welcome_yields_transition_to_ack() {
        let mut overlay = Passthrough::default();
        assert_eq!(overlay.process_commit_welcome(&[0, 7, 0xAA]), Some(7));
        assert_eq!(overlay.process_commit_welcome(&[0, 0, 0xAA]), None);
        assert_eq!(overlay.process_commit_welcome(&[1]), None);
    }
}
