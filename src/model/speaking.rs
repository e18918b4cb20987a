//! Speaking-state bitfield shared by both directions of the gateway.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Flags describing how a user is transmitting audio.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SpeakingState: u8 {
        /// Normal transmission of voice audio.
        const MICROPHONE = 1;
        /// Transmission of context audio for video; no speaking indicator.
        const SOUNDSHARE = 1 << 1;
        /// Priority speaker, lowering the volume of other speakers.
        const PRIORITY = 1 << 2;
    }
}

impl SpeakingState {
    /// Whether any audio is being transmitted at all.
    #[must_use]
    pub fn is_speaking(self) -> bool {
        !self.is_empty()
    }
}

impl Serialize for SpeakingState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for SpeakingState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Some gateway frames widen this to a full integer: accept u64.
        let bits = u64::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits as u8))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bits_round_trip() {
        let state = SpeakingState::MICROPHONE | SpeakingState::PRIORITY;
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "5");
        let back: SpeakingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let state: SpeakingState = serde_json::from_str("255").unwrap();
        assert_eq!(
            state,
            SpeakingState::MICROPHONE | SpeakingState::SOUNDSHARE | SpeakingState::PRIORITY
        );
        assert!(state.is_speaking());
    }
}
