use crate::{
    driver::{Config, Driver},
    error::{ConnectionResult, JoinError, JoinResult},
    id::{ChannelId, GuildId, UserId},
    info::{ConnectionInfo, ConnectionProgress},
    join::{Join, JoinGateway},
    shards::Shard,
};
use flume::Sender;
use tracing::instrument;

#[derive(Clone, Debug)]
enum Return {
    Info(Sender<ConnectionInfo>),
    Conn(Sender<()>, Sender<ConnectionResult<()>>),
}

/// The voice session of one guild: main-gateway bookkeeping plus the
/// driver carrying its audio.
///
/// A `Call` accumulates the session id, token, and endpoint delivered by the
/// main gateway in response to a join request, then hands them to its
/// [`Driver`]. At most one session is live per guild: a second [`join`]
/// before [`leave`] is refused.
///
/// [`Driver`]: crate::driver::Driver
/// [`join`]: Call::join
/// [`leave`]: Call::leave
#[derive(Debug)]
pub struct Call {
    connection: Option<(ConnectionProgress, Return)>,

    config: Config,
    driver: Driver,
    guild_id: GuildId,

    self_deaf: bool,
    self_mute: bool,
    user_id: UserId,

    ws: Option<Shard>,
}

impl Call {
    /// Creates a new `Call`, to be connected later via [`join`].
    ///
    /// [`join`]: Call::join
    #[must_use]
    pub fn new(guild_id: GuildId, ws: Shard, user_id: UserId) -> Self {
        Self::from_config(guild_id, ws, user_id, Config::default())
    }

    /// Creates a new `Call` with a custom configuration.
    #[must_use]
    pub fn from_config(guild_id: GuildId, ws: Shard, user_id: UserId, config: Config) -> Self {
        Call {
            connection: None,
            driver: Driver::new(config.clone()),
            config,
            guild_id,
            self_deaf: false,
            self_mute: false,
            user_id,
            ws: Some(ws),
        }
    }

    /// Creates a call with no main-gateway sink attached.
    ///
    /// Such a call cannot `join`: it exists to drive a session whose
    /// connection info was obtained elsewhere, via
    /// [`Driver::connect`].
    ///
    /// [`Driver::connect`]: crate::driver::Driver::connect
    #[must_use]
    pub fn standalone(guild_id: GuildId, user_id: UserId) -> Self {
        Call {
            connection: None,
            driver: Driver::new(Config::default()),
            config: Config::default(),
            guild_id,
            self_deaf: false,
            self_mute: false,
            user_id,
            ws: None,
        }
    }

    /// The driver carrying this call's audio.
    #[must_use]
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Mutable access to the driver, for playback and subscription control.
    pub fn driver_mut(&mut self) -> &mut Driver {
        &mut self.driver
    }

    /// Connect to the given voice channel by its Id.
    ///
    /// This function acts as a future in two stages:
    /// * The first `await` sends the request over the main gateway.
    /// * The second `await`s the driver's connection attempt. To prevent
    ///   deadlock, any mutexes around this `Call` *must* be released before
    ///   this result is queried.
    ///
    /// When using [`Voicebox::join`], this pattern is correctly handled for
    /// you.
    ///
    /// [`Voicebox::join`]: crate::Voicebox::join
    #[instrument(skip(self))]
    pub async fn join(&mut self, channel_id: ChannelId) -> JoinResult<Join> {
        if self.connection.is_some() {
            return Err(JoinError::AlreadyJoined);
        }

        let (tx, rx) = flume::unbounded();
        let (gw_tx, gw_rx) = flume::unbounded();

        self.connection = Some((
            ConnectionProgress::new(self.guild_id, self.user_id, channel_id),
            Return::Conn(gw_tx, tx),
        ));

        let timeout = self.config.gateway_timeout;

        match self.update().await {
            Ok(()) => Ok(Join::new(
                rx.into_recv_async(),
                gw_rx.into_recv_async(),
                timeout,
            )),
            Err(e) => {
                self.connection = None;
                Err(e)
            },
        }
    }

    /// Join the selected voice channel, *without* running an RTP session.
    ///
    /// Use this if you require connection info for some other voice
    /// implementation, and do not want the driver for this call.
    #[instrument(skip(self))]
    pub async fn join_gateway(&mut self, channel_id: ChannelId) -> JoinResult<JoinGateway> {
        if self.connection.is_some() {
            return Err(JoinError::AlreadyJoined);
        }

        let (tx, rx) = flume::unbounded();

        self.connection = Some((
            ConnectionProgress::new(self.guild_id, self.user_id, channel_id),
            Return::Info(tx),
        ));

        let timeout = self.config.gateway_timeout;

        match self.update().await {
            Ok(()) => Ok(JoinGateway::new(rx.into_recv_async(), timeout)),
            Err(e) => {
                self.connection = None;
                Err(e)
            },
        }
    }

    /// Leaves the current voice channel, closing the session.
    ///
    /// This does *not* forget settings, like whether to be self-deafened or
    /// self-muted.
    #[instrument(skip(self))]
    pub async fn leave(&mut self) -> JoinResult<()> {
        self.connection = None;
        self.driver.leave();

        self.update().await
    }

    /// Sets whether the current connection is to be deafened.
    ///
    /// **Note**: unlike mute, deafening is applied server-side.
    #[instrument(skip(self))]
    pub async fn deafen(&mut self, deaf: bool) -> JoinResult<()> {
        self.self_deaf = deaf;

        self.update().await
    }

    /// Returns whether the current connection is self-deafened.
    #[must_use]
    pub fn is_deaf(&self) -> bool {
        self.self_deaf
    }

    /// Sets whether the current connection is to be muted.
    #[instrument(skip(self))]
    pub async fn mute(&mut self, mute: bool) -> JoinResult<()> {
        self.self_mute = mute;
        self.driver.mute(mute);

        self.update().await
    }

    /// Returns whether the current connection is self-muted.
    #[must_use]
    pub fn is_mute(&self) -> bool {
        self.self_mute
    }

    /// Returns the current voice connection details, if available.
    #[instrument(skip(self))]
    pub fn current_connection(&self) -> Option<&ConnectionInfo> {
        match &self.connection {
            Some((progress, _)) => progress.get_connection_info(),
            _ => None,
        }
    }

    /// Returns the `id` of the channel, if connected or connecting to any.
    #[instrument(skip(self))]
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.connection
            .as_ref()
            .map(|(progress, _)| progress.channel_id())
    }

    /// Processes a `VOICE_SERVER_UPDATE` delivered by the main gateway.
    #[instrument(skip(self, token))]
    pub fn update_server(&mut self, endpoint: String, token: String) {
        let try_connect = self
            .connection
            .as_mut()
            .is_some_and(|(progress, _)| progress.apply_server_update(endpoint, token));

        if try_connect {
            self.do_full_connect();
        }
    }

    /// Processes this bot's own `VOICE_STATE_UPDATE` from the main gateway.
    ///
    /// A `None` channel means the bot was removed from voice (kick, channel
    /// deletion): the session closes and cannot resume.
    #[instrument(skip(self, session_id))]
    pub fn update_state(&mut self, session_id: String, channel_id: Option<ChannelId>) {
        let Some(channel_id) = channel_id else {
            self.connection = None;
            self.driver.leave();
            return;
        };

        let try_connect = self
            .connection
            .as_mut()
            .is_some_and(|(progress, _)| progress.apply_state_update(session_id, channel_id));

        if try_connect {
            self.do_full_connect();
        }
    }

    fn do_full_connect(&mut self) {
        let Some((progress, ret)) = &self.connection else {
            return;
        };
        let Some(info) = progress.info() else {
            return;
        };

        match ret {
            Return::Conn(gw_tx, result_tx) => {
                // Other side may not be listening: this is fine.
                drop(gw_tx.send(()));
                let result_tx = result_tx.clone();
                self.driver.raw_connect(info, result_tx);
            },
            Return::Info(tx) => {
                drop(tx.send(info));
            },
        }
    }

    /// Propagates the current state over the main gateway.
    async fn update(&mut self) -> JoinResult<()> {
        let channel_id = self
            .connection
            .as_ref()
            .map(|(progress, _)| progress.channel_id());

        match &self.ws {
            Some(shard) =>
                shard
                    .update_voice_state(self.guild_id, channel_id, self.self_deaf, self.self_mute)
                    .await,
            None => Err(JoinError::NoSender),
        }
    }

    /// The configuration this call was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}
