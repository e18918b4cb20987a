//! Typed payload bodies for voice gateway frames.

use super::SpeakingState;
use crate::id::{GuildId, UserId};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Auth handshake for a fresh session, sent after HELLO.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Identify {
    /// Guild whose voice server is being joined.
    pub server_id: GuildId,
    /// This bot's user id.
    pub user_id: UserId,
    /// Session id delivered by the main gateway's state update.
    pub session_id: String,
    /// Ephemeral token delivered by the main gateway's server update.
    pub token: String,
    /// Highest E2EE overlay protocol version this client supports.
    pub max_dave_protocol_version: u16,
}

/// Re-attach to an existing session after a dropped socket.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Resume {
    /// Guild whose voice server is being rejoined.
    pub server_id: GuildId,
    /// Session id of the session being resumed.
    pub session_id: String,
    /// Token of the session being resumed.
    pub token: String,
    /// Last server sequence number observed before the drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

/// The server's first frame on any socket.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Hello {
    /// Interval between heartbeats, in (possibly fractional) milliseconds.
    pub heartbeat_interval: f64,
}

/// Server handoff of the RTP parameters for this session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Ready {
    /// Synchronisation source assigned to this client's audio stream.
    pub ssrc: u32,
    /// Voice server UDP address.
    pub ip: IpAddr,
    /// Voice server UDP port.
    pub port: u16,
    /// Encryption modes offered by the server.
    pub modes: Vec<String>,
}

/// Periodic control-plane keepalive.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Heartbeat {
    /// Monotonic timestamp in milliseconds, echoed back by the ack.
    pub t: u64,
    /// Last server sequence number observed by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

/// Acknowledgement of a [`Heartbeat`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HeartbeatAck {
    /// The timestamp carried by the heartbeat being acknowledged.
    pub t: u64,
}

/// Delivery of the negotiated encryption mode and key; the session is
/// ready once this arrives.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionDescription {
    /// Encryption mode chosen by the server.
    ///
    /// This is authoritative, even if it differs from the mode the client
    /// asked for in SELECT_PROTOCOL.
    pub mode: String,
    /// Symmetric key for the chosen mode.
    pub secret_key: Vec<u8>,
    /// E2EE overlay protocol version in force, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dave_protocol_version: Option<u16>,
}

/// Speaking-state change, sent by either side.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Speaking {
    /// The user whose state changed; absent on client-sent frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// New transmission flags.
    pub speaking: SpeakingState,
    /// Audio delay hint; clients send 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    /// RTP stream carrying this user's audio.
    pub ssrc: u32,
}

/// Client transport selection after UDP discovery.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SelectProtocol {
    /// Always `"udp"` for this crate.
    pub protocol: String,
    /// Discovered external address plus chosen encryption mode.
    pub data: ProtocolData,
}

/// The body of a [`SelectProtocol`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProtocolData {
    /// This client's server-observed external IP.
    pub address: IpAddr,
    /// This client's server-observed external port.
    pub port: u16,
    /// Encryption mode the client would like to use.
    pub mode: String,
}

/// One or more clients joined the channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientsConnect {
    /// Users now present in the channel.
    pub user_ids: Vec<UserId>,
}

/// A client left the channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientDisconnect {
    /// The user who left.
    pub user_id: UserId,
}

/// E2EE overlay: a protocol transition is pending and must be acknowledged.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DavePrepareTransition {
    /// Version the overlay will move to.
    pub protocol_version: u16,
    /// Identifier to echo in the readiness acknowledgement.
    pub transition_id: u16,
}

/// E2EE overlay: execute a previously announced transition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DaveExecuteTransition {
    /// The transition being executed.
    pub transition_id: u16,
}

/// E2EE overlay: client readiness for a pending transition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DaveTransitionReady {
    /// The transition this client is ready for.
    pub transition_id: u16,
}

/// E2EE overlay: protocol version change for an upcoming epoch.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DavePrepareEpoch {
    /// Epoch the change applies from.
    pub epoch: u64,
    /// Version in force from that epoch.
    pub protocol_version: u16,
}
