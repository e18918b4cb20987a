#![deny(missing_docs)]
//! Warbler is an async, per-guild voice session driver for Discord bots.
//!
//! The library covers the full session lifecycle: the voice websocket
//! handshake (hello, identify/resume, ready, protocol selection, key
//! delivery), UDP IP discovery, heartbeating with sequence acknowledgement,
//! and bidirectional encrypted RTP audio. Audio encoding and decoding are
//! delegated to an external transcoder executable, keeping the core free of
//! codec dependencies.
//!
//! Three layers are exposed, outermost first:
//!  * [`Voicebox`] — a per-process directory of guild calls, fed by the two
//!    main-gateway events the core consumes.
//!  * [`Call`] — one guild's session: join/leave, mute/deafen, and the
//!    accumulation of session id, token, and endpoint.
//!  * [`Driver`] — the connection itself: playback, receive streams, typed
//!    [`events`], and lifecycle state.
//!
//! ## Intents
//! Joining voice requires your bot to receive `VOICE_STATE_UPDATE` and
//! `VOICE_SERVER_UPDATE`, i.e. the guild voice state intent.
//!
//! ## Audio
//! A transcoder speaking length-prefixed Opus frames must be resolvable on
//! `PATH` for playback and decoded receive; see [`input`].

pub mod constants;
pub mod driver;
pub mod error;
pub mod events;
mod handler;
pub mod id;
pub(crate) mod info;
pub mod input;
mod join;
mod manager;
pub mod model;
pub mod receive;
pub mod shards;
mod ws;

pub use crate::{
    driver::{Config, Driver},
    events::{EventStream, VoiceEvent},
    handler::Call,
    info::ConnectionInfo,
    join::{Join, JoinGateway},
    manager::Voicebox,
};
