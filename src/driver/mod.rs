//! Runner for a voice connection.
//!
//! The driver is a mixed-sync system:
//!  * asynchronous connection management, gateway dispatch, and UDP I/O;
//!  * a synchronous transmit thread pacing packets from the encoder child.
//!
//! This splits up work according to its IO/compute bound nature, preventing
//! packet pacing from being disturbed by other asynchronous tasks your bot
//! must handle.

mod config;
pub(crate) mod connection;
pub mod crypto;
pub mod dave;
mod state;
pub(crate) mod tasks;

pub use config::{Config, OverlayFactory};
pub use crypto::CryptoMode;
pub use state::SessionState;
pub(crate) use state::StateFlag;

use crate::{
    error::{PlayError, PlayResult},
    events::EventStream,
    id::UserId,
    input::AudioSource,
    receive::{ReceiveStream, StreamHub},
    ConnectionInfo,
};
use connection::error::{Error, Result};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use flume::{r#async::RecvFut, Sender};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tasks::message::CoreMessage;
use tracing::instrument;

/// Counters published by a live driver.
#[derive(Debug, Default)]
pub struct DriverStats {
    decrypt_failures: AtomicU64,
}

impl DriverStats {
    pub(crate) fn count_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound packets dropped for failing authentication.
    #[must_use]
    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }
}

/// The control object for a voice connection, handling connection lifecycle,
/// encrypted RTP transmit/receive, subprocess audio, and event generation.
#[derive(Clone, Debug)]
pub struct Driver {
    config: Config,
    self_mute: bool,
    sender: Sender<CoreMessage>,
    state: StateFlag,
    stats: Arc<DriverStats>,
    hub: Arc<StreamHub>,
}

impl Driver {
    /// Creates a new voice driver.
    ///
    /// This will create the core voice tasks in the background.
    #[inline]
    #[must_use]
    pub fn new(config: Config) -> Self {
        let state = StateFlag::new();
        let stats = Arc::new(DriverStats::default());
        let hub = Arc::new(StreamHub::default());
        let sender = Self::start_inner(config.clone(), state.clone(), stats.clone(), hub.clone());

        Driver {
            config,
            self_mute: false,
            sender,
            state,
            stats,
            hub,
        }
    }

    fn start_inner(
        config: Config,
        state: StateFlag,
        stats: Arc<DriverStats>,
        hub: Arc<StreamHub>,
    ) -> Sender<CoreMessage> {
        let (tx, rx) = flume::unbounded();

        tasks::start(config, rx, tx.clone(), state, stats, hub);

        tx
    }

    fn restart_inner(&mut self) {
        self.sender = Self::start_inner(
            self.config.clone(),
            self.state.clone(),
            self.stats.clone(),
            self.hub.clone(),
        );

        let mute = self.self_mute;
        self.mute(mute);
    }

    /// Connects to a voice channel using the specified session parameters.
    ///
    /// This method instantly contacts the driver tasks, and does not need to
    /// be `await`ed to start the actual connection.
    #[instrument(skip(self))]
    pub fn connect(&mut self, info: ConnectionInfo) -> Connect {
        let (tx, rx) = flume::bounded(1);

        self.raw_connect(info, tx);

        Connect {
            inner: rx.into_recv_async(),
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn raw_connect(&mut self, info: ConnectionInfo, tx: Sender<Result<()>>) {
        self.send(CoreMessage::ConnectWithResult(info, tx));
    }

    /// Closes the current session, terminating timers, sockets, and any
    /// transcoder children.
    ///
    /// Closure is idempotent, and forbids a later resume: re-joining starts
    /// a brand new session.
    #[instrument(skip(self))]
    pub fn leave(&mut self) {
        self.send(CoreMessage::Disconnect);
    }

    /// Sets whether the current connection is to be muted.
    ///
    /// A muted driver processes audio internally but submits none.
    #[instrument(skip(self))]
    pub fn mute(&mut self, mute: bool) {
        self.self_mute = mute;
        self.send(CoreMessage::Mute(mute));
    }

    /// Returns whether the driver is muted.
    #[instrument(skip(self))]
    #[must_use]
    pub fn is_mute(&self) -> bool {
        self.self_mute
    }

    /// Starts transmitting audio from a byte source.
    ///
    /// One transmission may be live per session: a second request fails with
    /// [`PlayError::AlreadyPlaying`] until the first ends or is stopped.
    ///
    /// [`PlayError::AlreadyPlaying`]: crate::error::PlayError::AlreadyPlaying
    #[instrument(skip(self, source))]
    pub async fn play(&mut self, source: AudioSource) -> PlayResult<()> {
        let (tx, rx) = flume::bounded(1);
        self.send(CoreMessage::Play(source, tx));

        rx.recv_async().await.map_err(|_| PlayError::Dropped)?
    }

    /// Suspends the active transmission without emitting silence.
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        self.send(CoreMessage::Pause);
    }

    /// Resumes a paused transmission.
    #[instrument(skip(self))]
    pub fn resume_playback(&mut self) {
        self.send(CoreMessage::ResumePlayback);
    }

    /// Ends the active transmission: the silence run is sent, then the
    /// speaking flag drops.
    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        self.send(CoreMessage::Stop);
    }

    /// Scales PCM sources before encoding. `1.0` is unity gain.
    #[instrument(skip(self))]
    pub fn set_volume(&mut self, volume: f32) {
        self.send(CoreMessage::SetVolume(volume));
    }

    /// Subscribes to every event this session emits.
    pub fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = flume::unbounded();
        self.send(CoreMessage::Subscribe(tx, None));

        EventStream { rx }
    }

    /// Subscribes to one user's speaking updates only.
    pub fn subscribe_speaking(&mut self, user_id: UserId) -> EventStream {
        let (tx, rx) = flume::unbounded();
        self.send(CoreMessage::Subscribe(tx, Some(user_id)));

        EventStream { rx }
    }

    /// Attaches a stream of decoded audio from the channel's other users.
    #[must_use]
    pub fn receive_stream(&self) -> ReceiveStream {
        self.hub.attach()
    }

    /// The session's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Live counters for this driver.
    #[must_use]
    pub fn stats(&self) -> Arc<DriverStats> {
        self.stats.clone()
    }

    fn send(&mut self, status: CoreMessage) {
        // The task is always live while a sender exists; a failed send means
        // it panicked or was cancelled, so rebuild it.
        if let Err(flume::SendError(status)) = self.sender.send(status) {
            self.restart_inner();
            drop(self.sender.send(status));
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Future for a call to [`Driver::connect`].
pub struct Connect {
    inner: RecvFut<'static, Result<()>>,
}

impl Future for Connect {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::AttemptDiscarded)))
    }
}
