//! Typed session events and subscription handles.
//!
//! Everything observable about a live session is published as a
//! [`VoiceEvent`] on subscriber channels handed out by
//! [`Driver::subscribe`]; there is no string-keyed emitter. Speaking
//! updates can additionally be narrowed to a single user with
//! [`Driver::subscribe_speaking`].
//!
//! [`Driver::subscribe`]: crate::driver::Driver::subscribe
//! [`Driver::subscribe_speaking`]: crate::driver::Driver::subscribe_speaking

use crate::{
    driver::CryptoMode,
    id::UserId,
    model::SpeakingState,
};
use std::time::Duration;

/// Events emitted over the lifetime of one voice session.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum VoiceEvent {
    /// Keys are installed and UDP is bound: audio may flow.
    Ready(ReadyInfo),
    /// An interrupted session re-attached without renegotiating keys.
    Resumed,
    /// The session ended; no further audio or events will follow.
    Closed(CloseInfo),
    /// A transport or protocol fault, rendered for observation.
    Error(String),
    /// A user's transmission flags changed.
    Speaking(SpeakingUpdate),
    /// A user left the channel.
    ClientDisconnect(UserId),
    /// A control-plane heartbeat was sent.
    WsHeartbeat {
        /// Monotonic timestamp carried by the beat.
        t: u64,
        /// Server sequence acknowledged by the beat.
        seq_ack: Option<u64>,
    },
    /// The server acknowledged a heartbeat.
    WsHeartbeatAck {
        /// Control-plane round-trip time.
        latency: Duration,
    },
    /// Round-trip latency sample, in milliseconds.
    WsPing(u64),
    /// A control frame arrived (raw opcode).
    WsMessage(u8),
    /// The websocket closed.
    WsClose {
        /// Close code supplied by the server, if any.
        code: Option<u16>,
    },
    /// The websocket faulted below the protocol layer.
    WsError(String),
}

/// Payload of [`VoiceEvent::Ready`].
#[derive(Clone, Copy, Debug)]
pub struct ReadyInfo {
    /// SSRC assigned to this client's outbound stream.
    pub ssrc: u32,
    /// Encryption mode chosen by the server.
    pub mode: CryptoMode,
}

/// Payload of [`VoiceEvent::Closed`].
#[derive(Clone, Copy, Debug)]
pub struct CloseInfo {
    /// Close code, where the server initiated the closure.
    pub code: Option<u16>,
    /// Whether the local caller closed the session.
    pub by_user: bool,
}

/// Payload of [`VoiceEvent::Speaking`].
#[derive(Clone, Copy, Debug)]
pub struct SpeakingUpdate {
    /// The user whose state changed; may lag SSRC mapping.
    pub user_id: Option<UserId>,
    /// RTP stream carrying that user's audio.
    pub ssrc: u32,
    /// The new flags.
    pub speaking: SpeakingState,
}

/// A subscription to one session's events.
pub struct EventStream {
    pub(crate) rx: flume::Receiver<VoiceEvent>,
}

impl EventStream {
    /// Waits for the next event.
    ///
    /// Returns `None` once the session's event task has shut down.
    pub async fn recv(&self) -> Option<VoiceEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Returns an event if one is already queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<VoiceEvent> {
        self.rx.try_recv().ok()
    }
}
