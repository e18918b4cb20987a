//! Handlers for sending voice state updates over the main gateway.
//!
//! The session core never owns a main-gateway socket: the host bot supplies
//! a [`VoiceUpdate`] implementation, and receives the state/server update
//! events it must feed back via [`Voicebox::process_state_update`] and
//! [`Voicebox::process_server_update`].
//!
//! [`Voicebox::process_state_update`]: crate::Voicebox::process_state_update
//! [`Voicebox::process_server_update`]: crate::Voicebox::process_server_update

use crate::{
    error::JoinResult,
    id::{ChannelId, GuildId},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{fmt, sync::Arc};

/// Sink for `UPDATE_VOICE_STATE` frames on the main gateway.
///
/// This allows any client library (or raw socket) to carry the one outbound
/// message the voice core needs.
#[async_trait]
pub trait VoiceUpdate {
    /// Requests a move into `channel_id` of `guild_id` (or out of voice
    /// entirely, when `None`).
    async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_deaf: bool,
        self_mute: bool,
    ) -> JoinResult<()>;
}

/// Handle to the main-gateway shard responsible for a guild.
#[derive(Clone)]
pub struct Shard(Arc<dyn VoiceUpdate + Send + Sync>);

impl Shard {
    /// Wraps a gateway sink as a shard handle.
    #[must_use]
    pub fn new(inner: Arc<dyn VoiceUpdate + Send + Sync>) -> Self {
        Self(inner)
    }

    pub(crate) async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_deaf: bool,
        self_mute: bool,
    ) -> JoinResult<()> {
        self.0
            .update_voice_state(guild_id, channel_id, self_deaf, self_mute)
            .await
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Shard(..)")
    }
}

/// Builds the main-gateway frame (opcode 4) a [`VoiceUpdate`] implementation
/// should send for the given state.
#[must_use]
pub fn voice_state_frame(
    guild_id: GuildId,
    channel_id: Option<ChannelId>,
    self_deaf: bool,
    self_mute: bool,
) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_deaf": self_deaf,
            "self_mute": self_mute,
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join_frame_shape() {
        let frame = voice_state_frame(GuildId::from(1), Some(ChannelId::from(2)), false, true);
        assert_eq!(frame["op"], 4);
        assert_eq!(frame["d"]["guild_id"], "1");
        assert_eq!(frame["d"]["channel_id"], "2");
        assert_eq!(frame["d"]["self_mute"], true);
        assert_eq!(frame["d"]["self_deaf"], false);
    }

    #[test]
    fn leave_frame_nulls_the_channel() {
        let frame = voice_state_frame(GuildId::from(1), None, false, false);
        assert!(frame["d"]["channel_id"].is_null());
    }
}
