//! Wire model for the voice gateway.
//!
//! Text frames are JSON objects `{op, d, s?}`; binary frames (used by the
//! E2EE media overlay) are `[u16 seq][u8 op][payload...]`. Both parse into a
//! [`Frame`], which pairs the server sequence number with a typed [`Event`].

pub mod close_code;
pub mod opcode;
pub mod payload;
mod speaking;

pub use close_code::CloseCode;
pub use opcode::Opcode;
pub use speaking::SpeakingState;

use payload::*;
use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use serde_json::Value;

/// A parsed gateway frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Server-assigned sequence number, fed back via heartbeats and resume.
    pub seq: Option<u64>,
    /// The frame body.
    pub event: Event,
}

/// Every control frame the voice gateway can carry.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    #[allow(missing_docs)]
    Identify(Identify),
    #[allow(missing_docs)]
    SelectProtocol(SelectProtocol),
    #[allow(missing_docs)]
    Ready(Ready),
    #[allow(missing_docs)]
    Heartbeat(Heartbeat),
    #[allow(missing_docs)]
    SessionDescription(SessionDescription),
    #[allow(missing_docs)]
    Speaking(Speaking),
    #[allow(missing_docs)]
    HeartbeatAck(HeartbeatAck),
    #[allow(missing_docs)]
    Resume(Resume),
    #[allow(missing_docs)]
    Hello(Hello),
    /// Acknowledgement of a successful resume; carries no body.
    Resumed,
    #[allow(missing_docs)]
    ClientsConnect(ClientsConnect),
    #[allow(missing_docs)]
    ClientDisconnect(ClientDisconnect),
    #[allow(missing_docs)]
    DavePrepareTransition(DavePrepareTransition),
    #[allow(missing_docs)]
    DaveExecuteTransition(DaveExecuteTransition),
    #[allow(missing_docs)]
    DaveTransitionReady(DaveTransitionReady),
    #[allow(missing_docs)]
    DavePrepareEpoch(DavePrepareEpoch),
    /// Opaque binary frame from the E2EE overlay.
    DaveBinary {
        /// Raw opcode from the binary header.
        op: u8,
        /// MLS payload, uninterpreted by this crate.
        payload: Vec<u8>,
    },
    /// A frame whose opcode this crate does not understand.
    Unknown {
        /// Raw opcode.
        op: u8,
        /// Unparsed body.
        data: Value,
    },
}

impl Event {
    /// The opcode this event maps to, where one is known.
    #[must_use]
    pub fn kind(&self) -> Option<Opcode> {
        Some(match self {
            Event::Identify(_) => Opcode::Identify,
            Event::SelectProtocol(_) => Opcode::SelectProtocol,
            Event::Ready(_) => Opcode::Ready,
            Event::Heartbeat(_) => Opcode::Heartbeat,
            Event::SessionDescription(_) => Opcode::SessionDescription,
            Event::Speaking(_) => Opcode::Speaking,
            Event::HeartbeatAck(_) => Opcode::HeartbeatAck,
            Event::Resume(_) => Opcode::Resume,
            Event::Hello(_) => Opcode::Hello,
            Event::Resumed => Opcode::Resumed,
            Event::ClientsConnect(_) => Opcode::ClientsConnect,
            Event::ClientDisconnect(_) => Opcode::ClientDisconnect,
            Event::DavePrepareTransition(_) => Opcode::DavePrepareTransition,
            Event::DaveExecuteTransition(_) => Opcode::DaveExecuteTransition,
            Event::DaveTransitionReady(_) => Opcode::DaveTransitionReady,
            Event::DavePrepareEpoch(_) => Opcode::DavePrepareEpoch,
            Event::DaveBinary { op, .. } | Event::Unknown { op, .. } =>
                return Opcode::from_u8(*op),
        })
    }

    pub(crate) fn raw_op(&self) -> u8 {
        match self {
            Event::DaveBinary { op, .. } | Event::Unknown { op, .. } => *op,
            other => other
                .kind()
                .expect("every structured event maps to an opcode") as u8,
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Frame", 2)?;
        state.serialize_field("op", &self.raw_op())?;

        match self {
            Event::Identify(d) => state.serialize_field("d", d)?,
            Event::SelectProtocol(d) => state.serialize_field("d", d)?,
            Event::Ready(d) => state.serialize_field("d", d)?,
            Event::Heartbeat(d) => state.serialize_field("d", d)?,
            Event::SessionDescription(d) => state.serialize_field("d", d)?,
            Event::Speaking(d) => state.serialize_field("d", d)?,
            Event::HeartbeatAck(d) => state.serialize_field("d", d)?,
            Event::Resume(d) => state.serialize_field("d", d)?,
            Event::Hello(d) => state.serialize_field("d", d)?,
            Event::Resumed => state.serialize_field("d", &Value::Null)?,
            Event::ClientsConnect(d) => state.serialize_field("d", d)?,
            Event::ClientDisconnect(d) => state.serialize_field("d", d)?,
            Event::DavePrepareTransition(d) => state.serialize_field("d", d)?,
            Event::DaveExecuteTransition(d) => state.serialize_field("d", d)?,
            Event::DaveTransitionReady(d) => state.serialize_field("d", d)?,
            Event::DavePrepareEpoch(d) => state.serialize_field("d", d)?,
            Event::DaveBinary { payload, .. } => state.serialize_field("d", payload)?,
            Event::Unknown { data, .. } => state.serialize_field("d", data)?,
        }

        state.end()
    }
}

macro_rules! from_payload {
    ($($payload:ident),*) => {
        $(
            impl From<$payload> for Event {
                fn from(value: $payload) -> Self {
                    Event::$payload(value)
                }
            }
        )*
    };
}

from_payload!(
    Identify,
    SelectProtocol,
    Ready,
    Heartbeat,
    SessionDescription,
    Speaking,
    HeartbeatAck,
    Resume,
    Hello,
    ClientsConnect,
    ClientDisconnect,
    DavePrepareTransition,
    DaveExecuteTransition,
    DaveTransitionReady,
    DavePrepareEpoch
);

#[derive(Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
}

impl Frame {
    /// Parses a text gateway frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let event = match Opcode::from_u8(raw.op) {
            Some(Opcode::Identify) => Event::Identify(serde_json::from_value(raw.d)?),
            Some(Opcode::SelectProtocol) => Event::SelectProtocol(serde_json::from_value(raw.d)?),
            Some(Opcode::Ready) => Event::Ready(serde_json::from_value(raw.d)?),
            Some(Opcode::Heartbeat) => Event::Heartbeat(serde_json::from_value(raw.d)?),
            Some(Opcode::SessionDescription) =>
                Event::SessionDescription(serde_json::from_value(raw.d)?),
            Some(Opcode::Speaking) => Event::Speaking(serde_json::from_value(raw.d)?),
            Some(Opcode::HeartbeatAck) => Event::HeartbeatAck(serde_json::from_value(raw.d)?),
            Some(Opcode::Resume) => Event::Resume(serde_json::from_value(raw.d)?),
            Some(Opcode::Hello) => Event::Hello(serde_json::from_value(raw.d)?),
            Some(Opcode::Resumed) => Event::Resumed,
            Some(Opcode::ClientsConnect) => Event::ClientsConnect(serde_json::from_value(raw.d)?),
            Some(Opcode::ClientDisconnect) =>
                Event::ClientDisconnect(serde_json::from_value(raw.d)?),
            Some(Opcode::DavePrepareTransition) =>
                Event::DavePrepareTransition(serde_json::from_value(raw.d)?),
            Some(Opcode::DaveExecuteTransition) =>
                Event::DaveExecuteTransition(serde_json::from_value(raw.d)?),
            Some(Opcode::DaveTransitionReady) =>
                Event::DaveTransitionReady(serde_json::from_value(raw.d)?),
            Some(Opcode::DavePrepareEpoch) =>
                Event::DavePrepareEpoch(serde_json::from_value(raw.d)?),
            // The remaining overlay opcodes are binary-only; a text body is
            // out of contract, so hold onto it unparsed.
            _ => Event::Unknown {
                op: raw.op,
                data: raw.d,
            },
        };

        Ok(Frame { seq: raw.s, event })
    }

    /// Parses a binary gateway frame, used by the E2EE overlay.
    ///
    /// Returns `None` when the frame is too short to carry its own header.
    #[must_use]
    pub fn parse_binary(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }

        let seq = u16::from_be_bytes([bytes[0], bytes[1]]);
        Some(Frame {
            seq: Some(u64::from(seq)),
            event: Event::DaveBinary {
                op: bytes[2],
                payload: bytes[3..].to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::id::UserId;

    #[test]
    fn hello_parses() {
        let frame = Frame::parse(r#"{"op":8,"d":{"heartbeat_interval":41250.0}}"#).unwrap();
        assert_eq!(frame.seq, None);
        let Event::Hello(hello) = frame.event else {
            panic!("wrong event");
        };
        assert!((hello.heartbeat_interval - 41250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ready_parses_with_sequence() {
        let text = r#"{"op":2,"s":5,"d":{"ssrc":7,"ip":"1.2.3.4","port":50000,"modes":["aead_aes256_gcm_rtpsize","xsalsa20_poly1305"]}}"#;
        let frame = Frame::parse(text).unwrap();
        assert_eq!(frame.seq, Some(5));
        let Event::Ready(ready) = frame.event else {
            panic!("wrong event");
        };
        assert_eq!(ready.ssrc, 7);
        assert_eq!(ready.port, 50_000);
        assert_eq!(ready.modes.len(), 2);
    }

    #[test]
    fn speaking_parses_without_delay() {
        let text = r#"{"op":5,"d":{"speaking":5,"ssrc":110,"user_id":"53908232506183680"}}"#;
        let frame = Frame::parse(text).unwrap();
        let Event::Speaking(speaking) = frame.event else {
            panic!("wrong event");
        };
        assert_eq!(speaking.user_id, Some(UserId::from(53_908_232_506_183_680)));
        assert!(speaking.speaking.contains(SpeakingState::MICROPHONE));
        assert_eq!(speaking.delay, None);
    }

    #[test]
    fn identify_serializes_with_opcode_zero() {
        let event = Event::from(Identify {
            server_id: 1.into(),
            user_id: 2.into(),
            session_id: "s".into(),
            token: "t".into(),
            max_dave_protocol_version: 0,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["op"], 0);
        assert_eq!(value["d"]["server_id"], "1");
        assert_eq!(value["d"]["token"], "t");
    }

    #[test]
    fn session_description_round_trips() {
        let event = Event::from(SessionDescription {
            mode: "aead_aes256_gcm_rtpsize".into(),
            secret_key: vec![1; 32],
            dave_protocol_version: None,
        });
        let text = serde_json::to_string(&event).unwrap();
        let frame = Frame::parse(&text).unwrap();
        let Event::SessionDescription(desc) = frame.event else {
            panic!("wrong event");
        };
        assert_eq!(desc.mode, "aead_aes256_gcm_rtpsize");
        assert_eq!(desc.secret_key, vec![1; 32]);
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        let frame = Frame::parse(r#"{"op":18,"d":{"whatever":true}}"#).unwrap();
        let Event::Unknown { op, data } = frame.event else {
            panic!("wrong event");
        };
        assert_eq!(op, 18);
        assert_eq!(data["whatever"], true);
    }

    #[test]
    fn binary_frames_parse() {
        let frame = Frame::parse_binary(&[0, 5, 27, 1, 2, 3]).unwrap();
        assert_eq!(frame.seq, Some(5));
        let Event::DaveBinary { op, payload } = frame.event else {
            panic!("wrong event");
        };
        assert_eq!(op, 27);
        assert_eq!(payload, vec![1, 2, 3]);
        assert!(Frame::parse_binary(&[1, 2]).is_none());
    }
}
