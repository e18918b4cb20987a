use crate::{
    error::{JoinError, JoinResult},
    id::{ChannelId, GuildId, UserId},
    shards::Shard,
    Call,
    Config,
    ConnectionInfo,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock as PRwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
struct ClientData {
    user_id: UserId,
}

/// A struct responsible for managing [`Call`]s.
///
/// This manager transparently maps guild state and a source of shard
/// information into individual calls. It guarantees at most one live voice
/// session per guild, and is the entry point through which the host bot
/// feeds the two main-gateway events the voice core consumes.
///
/// [`Call`]: Call
#[derive(Debug)]
pub struct Voicebox {
    client_data: OnceCell<ClientData>,
    calls: DashMap<GuildId, Arc<Mutex<Call>>>,
    sharder: Shard,
    config: PRwLock<Config>,
}

impl Voicebox {
    /// Creates a new manager over the given gateway sink.
    #[must_use]
    pub fn new(sharder: Shard) -> Arc<Self> {
        Self::from_config(sharder, Config::default())
    }

    /// Creates a new manager with a custom configuration.
    #[must_use]
    pub fn from_config(sharder: Shard, config: Config) -> Arc<Self> {
        Arc::new(Self {
            client_data: OnceCell::new(),
            calls: DashMap::new(),
            sharder,
            config: PRwLock::new(config),
        })
    }

    /// Records the bot's own user id, once known.
    ///
    /// This must happen before any `join`; later calls are no-ops.
    pub fn initialise_client_data<U: Into<UserId>>(&self, user_id: U) {
        let _ = self.client_data.set(ClientData {
            user_id: user_id.into(),
        });
    }

    /// Retrieves the call for the given guild, if one exists.
    #[must_use]
    pub fn get<G: Into<GuildId>>(&self, guild_id: G) -> Option<Arc<Mutex<Call>>> {
        self.calls.get(&guild_id.into()).map(|e| e.value().clone())
    }

    /// Retrieves the call for the given guild, creating a new one if none
    /// is present.
    pub fn get_or_insert(&self, guild_id: GuildId) -> Arc<Mutex<Call>> {
        self.calls
            .entry(guild_id)
            .or_insert_with(|| {
                let data = self
                    .client_data
                    .get()
                    .expect("Manager's user id must be initialised before calls are made.");

                Arc::new(Mutex::new(Call::from_config(
                    guild_id,
                    self.sharder.clone(),
                    data.user_id,
                    self.config.read().clone(),
                )))
            })
            .clone()
    }

    /// Connects to the target voice channel, driving audio for its guild.
    ///
    /// A second join on a guild with a live session fails with
    /// [`JoinError::AlreadyJoined`] until the first is closed.
    ///
    /// [`JoinError::AlreadyJoined`]: crate::error::JoinError::AlreadyJoined
    pub async fn join<G, C>(&self, guild_id: G, channel_id: C) -> JoinResult<Arc<Mutex<Call>>>
    where
        G: Into<GuildId>,
        C: Into<ChannelId>,
    {
        let call = self.get_or_insert(guild_id.into());

        let stage_1 = {
            let mut handler = call.lock().await;
            handler.join(channel_id.into()).await?
        };

        // The lock MUST be released while awaiting the gateway, or incoming
        // state/server updates can never complete the handshake.
        stage_1.await.map(|()| call.clone())
    }

    /// Joins the target channel without starting an RTP session, returning
    /// the raw connection info.
    pub async fn join_gateway<G, C>(&self, guild_id: G, channel_id: C) -> JoinResult<ConnectionInfo>
    where
        G: Into<GuildId>,
        C: Into<ChannelId>,
    {
        let call = self.get_or_insert(guild_id.into());

        let stage_1 = {
            let mut handler = call.lock().await;
            handler.join_gateway(channel_id.into()).await?
        };

        stage_1.await
    }

    /// Leaves the voice channel of the given guild, if any.
    ///
    /// The call handle survives for rejoining; see [`remove`].
    ///
    /// [`remove`]: Voicebox::remove
    pub async fn leave<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<()> {
        match self.get(guild_id) {
            Some(call) => call.lock().await.leave().await,
            None => Err(JoinError::NoCall),
        }
    }

    /// Leaves and forgets the call of the given guild.
    pub async fn remove<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<()> {
        let guild_id = guild_id.into();
        self.leave(guild_id).await?;
        self.calls.remove(&guild_id);
        Ok(())
    }

    /// Feeds in this bot's `VOICE_STATE_UPDATE` from the main gateway.
    ///
    /// Updates for other users are ignored here; only the bot's own state
    /// carries the session id.
    pub async fn process_state_update(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) {
        if self.client_data.get().map(|d| d.user_id) != Some(user_id) {
            return;
        }

        if let Some(call) = self.get(guild_id) {
            call.lock().await.update_state(session_id, channel_id);
        } else {
            debug!("State update for guild {guild_id} with no call.");
        }
    }

    /// Feeds in a `VOICE_SERVER_UPDATE` from the main gateway.
    ///
    /// A missing endpoint means the old server died and a new one is being
    /// allocated: wait for the follow-up update.
    pub async fn process_server_update(
        &self,
        guild_id: GuildId,
        endpoint: Option<String>,
        token: String,
    ) {
        let Some(endpoint) = endpoint else {
            debug!("Server update for guild {guild_id} with no endpoint yet.");
            return;
        };

        if let Some(call) = self.get(guild_id) {
            call.lock().await.update_server(endpoint, token);
        } else {
            debug!("Server update for guild {guild_id} with no call.");
        }
    }

    /// Iterates over the guilds with a call handle.
    pub fn iter(&self) -> impl Iterator<Item = (GuildId, Arc<Mutex<Call>>)> + '_ {
        self.calls.iter().map(|e| (*e.key(), e.value().clone()))
    }
}
