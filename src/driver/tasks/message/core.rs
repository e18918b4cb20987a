#![allow(missing_docs)]

use crate::{
    driver::{connection::error::Error, crypto::CryptoError},
    error::PlayResult,
    events::VoiceEvent,
    id::UserId,
    input::AudioSource,
    model::payload::SessionDescription,
    ConnectionInfo,
};
use flume::Sender;

#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum CoreMessage {
    ConnectWithResult(ConnectionInfo, Sender<Result<(), Error>>),
    Disconnect,
    Play(AudioSource, Sender<PlayResult<()>>),
    Pause,
    ResumePlayback,
    Stop,
    SetVolume(f32),
    Mute(bool),
    Subscribe(Sender<VoiceEvent>, Option<UserId>),
    /// A transient websocket fault: redial and resume after backoff.
    Reconnect,
    /// A terminal websocket closure for the given connection attempt.
    SignalWsClosure(usize, Option<u16>),
    /// The server re-keyed a live session (mode rotation).
    Rekey(SessionDescription),
    /// Packet encryption can no longer proceed; the session must close.
    FatalCrypto(CryptoError),
    Poison,
}
