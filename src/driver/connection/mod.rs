pub mod error;

use super::{
    crypto::{Cipher, CryptoMode},
    state::{SessionState, StateFlag},
    tasks::{
        message::*,
        udp_rx,
        udp_tx,
        ws::{self as ws_task, AuxNetwork, NO_SEQ},
    },
    Config,
    DriverStats,
};
use crate::{
    constants::*,
    model::{
        payload::{Identify, ProtocolData, Resume, SelectProtocol},
        Event as GatewayEvent,
    },
    receive::StreamHub,
    ws::WsStream,
    ConnectionInfo,
};
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket};
use error::{Error, Result};
use flume::Sender;
use std::{
    net::IpAddr,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{net::UdpSocket, spawn, time::timeout};
use tracing::{debug, info, instrument};
use url::Url;

pub(crate) struct Connection {
    pub(crate) info: ConnectionInfo,
    pub(crate) ssrc: u32,
    pub(crate) mode: CryptoMode,
    pub(crate) attempt_idx: usize,
    pub(crate) ws: Sender<WsMessage>,
    last_seq: Arc<AtomicU64>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new(
        info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
        state: &StateFlag,
        stats: Arc<DriverStats>,
        hub: Arc<StreamHub>,
        idx: usize,
    ) -> Result<Connection> {
        if let Some(t) = config.driver_timeout {
            timeout(
                t,
                Connection::new_inner(info, interconnect, config, state, stats, hub, idx),
            )
            .await?
        } else {
            Connection::new_inner(info, interconnect, config, state, stats, hub, idx).await
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new_inner(
        mut info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
        state: &StateFlag,
        stats: Arc<DriverStats>,
        hub: Arc<StreamHub>,
        idx: usize,
    ) -> Result<Connection> {
        let url = generate_url(&mut info.endpoint)?;

        state.set(SessionState::Connecting);
        let mut client = WsStream::connect(url).await?;
        let last_seq = Arc::new(AtomicU64::new(NO_SEQ));

        // HELLO gates the identify; no other frame is valid this early.
        let hello = loop {
            let Some(frame) = client.recv_json().await? else {
                continue;
            };
            note_seq(&last_seq, frame.seq);

            match frame.event {
                GatewayEvent::Hello(h) => break h,
                other => {
                    debug!("Expected hello; got: {:?}", other);
                },
            }
        };

        state.set(SessionState::Identifying);
        let overlay = (config.overlay)();

        client
            .send_json(&GatewayEvent::from(Identify {
                server_id: info.guild_id,
                user_id: info.user_id,
                session_id: info.session_id.clone(),
                token: info.token.clone(),
                max_dave_protocol_version: overlay.max_protocol_version(),
            }))
            .await?;

        state.set(SessionState::AwaitingReady);
        let ready = loop {
            let Some(frame) = client.recv_json().await? else {
                continue;
            };
            note_seq(&last_seq, frame.seq);

            match frame.event {
                GatewayEvent::Ready(r) => break r,
                other => {
                    debug!("Expected ready; got: {:?}", other);
                },
            }
        };

        let request_mode = CryptoMode::negotiate(&ready.modes, config.crypto_mode)
            .ok_or(Error::CryptoModeUnavailable)?;

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.connect((ready.ip, ready.port)).await?;

        // Follow the voice server's IP discovery procedure, in case NAT
        // tunnelling is needed.
        let (ext_ip, ext_port) = discover_external_address(&udp, ready.ssrc).await?;

        client
            .send_json(&GatewayEvent::from(SelectProtocol {
                protocol: "udp".into(),
                data: ProtocolData {
                    address: ext_ip,
                    port: ext_port,
                    mode: request_mode.to_request_str().into(),
                },
            }))
            .await?;

        state.set(SessionState::AwaitingDescription);
        let desc = loop {
            let Some(frame) = client.recv_json().await? else {
                continue;
            };
            note_seq(&last_seq, frame.seq);

            match frame.event {
                GatewayEvent::SessionDescription(d) => break d,
                other => {
                    debug!("Expected session description; got: {:?}", other);
                },
            }
        };

        // The description is authoritative: honor its mode even if it differs
        // from the one we asked for.
        let mode = CryptoMode::from_request_str(&desc.mode).ok_or(Error::CryptoModeInvalid)?;
        let cipher =
            Cipher::new(mode, &desc.secret_key).map_err(|_| Error::CryptoInvalidLength)?;

        info!("Connected to: {}", info.endpoint);
        info!("WS heartbeat duration {}ms.", hello.heartbeat_interval);

        let (ws_msg_tx, ws_msg_rx) = flume::unbounded();
        let (udp_rx_msg_tx, udp_rx_msg_rx) = flume::unbounded();
        let (udp_tx_msg_tx, udp_tx_msg_rx) = flume::unbounded();

        let udp_std = udp.into_std()?;
        let udp_rx_sock = UdpSocket::from_std(udp_std.try_clone()?)?;
        let udp_tx_sock = Arc::new(UdpSocket::from_std(udp_std)?);

        let ssrc = ready.ssrc;

        let pipe_conn = PipelineConnection {
            cipher: cipher.clone(),
            crypto_state: mode.into(),
            udp_rx: udp_rx_msg_tx,
            udp_tx: udp_tx_msg_tx,
        };

        interconnect
            .pipeline
            .send(PipelineMessage::Ws(Some(ws_msg_tx.clone())))?;
        interconnect
            .pipeline
            .send(PipelineMessage::SetConn(pipe_conn, ssrc))?;

        let ssrc_tracker = Arc::new(SsrcTracker::default());

        let ws_state = AuxNetwork::new(
            ws_msg_rx,
            client,
            ssrc,
            hello.heartbeat_interval,
            last_seq.clone(),
            idx,
            ssrc_tracker.clone(),
            overlay,
        );

        spawn(ws_task::runner(interconnect.clone(), ws_state));

        spawn(udp_rx::runner(
            interconnect.clone(),
            udp_rx_msg_rx,
            cipher,
            mode,
            config.clone(),
            udp_rx_sock,
            ssrc_tracker,
            stats,
            hub,
        ));

        spawn(udp_tx::runner(udp_tx_msg_rx, ssrc, udp_tx_sock));

        Ok(Connection {
            info,
            ssrc,
            mode,
            attempt_idx: idx,
            ws: ws_msg_tx,
            last_seq,
        })
    }

    /// Re-attaches to the existing session over a fresh websocket.
    ///
    /// The UDP flow, SSRC, and keys all survive: only the control channel is
    /// replaced, so no discovery or key negotiation re-runs.
    #[instrument(skip(self, config))]
    pub(crate) async fn reconnect(&mut self, config: &Config) -> Result<()> {
        if let Some(t) = config.driver_timeout {
            timeout(t, self.reconnect_inner()).await?
        } else {
            self.reconnect_inner().await
        }
    }

    #[instrument(skip(self))]
    async fn reconnect_inner(&mut self) -> Result<()> {
        let url = generate_url(&mut self.info.endpoint)?;

        let mut client = WsStream::connect(url).await?;

        // A resumed socket still opens with HELLO.
        let hello = loop {
            let Some(frame) = client.recv_json().await? else {
                continue;
            };

            match frame.event {
                GatewayEvent::Hello(h) => break h,
                other => {
                    debug!("Expected hello; got: {:?}", other);
                },
            }
        };

        client
            .send_json(&GatewayEvent::from(Resume {
                server_id: self.info.guild_id,
                session_id: self.info.session_id.clone(),
                token: self.info.token.clone(),
                seq_ack: self.seen_seq(),
            }))
            .await?;

        loop {
            let Some(frame) = client.recv_json().await? else {
                continue;
            };
            note_seq(&self.last_seq, frame.seq);

            match frame.event {
                GatewayEvent::Resumed => break,
                other => {
                    debug!("Expected resumed; got: {:?}", other);
                },
            }
        }

        self.ws
            .send(WsMessage::SetKeepalive(hello.heartbeat_interval))?;
        self.ws.send(WsMessage::Ws(Box::new(client)))?;

        info!("Reconnected to: {}", &self.info.endpoint);
        Ok(())
    }

    fn seen_seq(&self) -> Option<u64> {
        let raw = self.last_seq.load(Ordering::Acquire);
        (raw != NO_SEQ).then_some(raw)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        info!("Disconnected");
    }
}

fn note_seq(last_seq: &AtomicU64, seq: Option<u64>) {
    if let Some(seq) = seq {
        last_seq.store(seq, Ordering::Release);
    }
}

fn generate_url(endpoint: &mut String) -> Result<Url> {
    if endpoint.ends_with(":80") {
        let len = endpoint.len();

        endpoint.truncate(len - 3);
    }

    Url::parse(&format!("wss://{endpoint}/?v={VOICE_GATEWAY_VERSION}")).or(Err(Error::EndpointUrl))
}

/// Performs the request half of IP discovery, returning this client's
/// server-observed external address.
async fn discover_external_address(udp: &UdpSocket, ssrc: u32) -> Result<(IpAddr, u16)> {
    let mut bytes = [0; IpDiscoveryPacket::const_packet_size()];
    {
        let mut view = MutableIpDiscoveryPacket::new(&mut bytes[..]).expect(
            "Too few bytes in 'bytes' for IPDiscovery packet.\
                (Blame: IpDiscoveryPacket::const_packet_size()?)",
        );
        view.set_pkt_type(IpDiscoveryType::Request);
        view.set_length(70);
        view.set_ssrc(ssrc);
    }

    udp.send(&bytes).await?;

    let (len, _addr) = udp.recv_from(&mut bytes).await?;
    let view = IpDiscoveryPacket::new(&bytes[..len]).ok_or(Error::IllegalDiscoveryResponse)?;

    if view.get_pkt_type() != IpDiscoveryType::Response {
        return Err(Error::IllegalDiscoveryResponse);
    }

    // We could do something clever like binary search, but possibility of UDP
    // spoofing precludes us from making the assumption we can find a "left
    // edge" of '\0's.
    let nul_byte_index = view
        .get_address_raw()
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::IllegalIp)?;

    let address_str = std::str::from_utf8(&view.get_address_raw()[..nul_byte_index])
        .map_err(|_| Error::IllegalIp)?;

    let address = IpAddr::from_str(address_str).map_err(|_| Error::IllegalIp)?;

    Ok((address, view.get_port()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn discovery_response(ssrc: u32, ip: &str, port: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; IpDiscoveryPacket::const_packet_size()];
        bytes[0..2].copy_from_slice(&2u16.to_be_bytes());
        bytes[2..4].copy_from_slice(&70u16.to_be_bytes());
        bytes[4..8].copy_from_slice(&ssrc.to_be_bytes());
        bytes[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
        bytes[72..74].copy_from_slice(&port.to_be_bytes());
        bytes
    }

    #[tokio::test]
    async fn discovery_parses_nul_padded_address() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();

        let reply = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, who) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, IpDiscoveryPacket::const_packet_size());
            assert_eq!(&buf[0..2], &1u16.to_be_bytes());
            assert_eq!(&buf[4..8], &7u32.to_be_bytes());

            let response = discovery_response(7, "203.0.113.9", 50_001);
            server.send_to(&response, who).await.unwrap();
        });

        let (ip, port) = discover_external_address(&client, 7).await.unwrap();
        reply.await.unwrap();

        assert_eq!(ip, IpAddr::from_str("203.0.113.9").unwrap());
        assert_eq!(port, 50_001);
    }

    #[tokio::test]
    async fn discovery_rejects_non_response_packets() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();

        let reply = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, who) = server.recv_from(&mut buf).await.unwrap();
            // Echo the request back unchanged: still type 0x0001.
            server.send_to(&buf[..len], who).await.unwrap();
        });

        let res = discover_external_address(&client, 7).await;
        reply.await.unwrap();

        assert!(matches!(res, Err(Error::IllegalDiscoveryResponse)));
    }

    #[test]
    fn urls_pin_gateway_version_and_strip_port_80() {
        let mut endpoint = "eu-west77.example.gg:80".to_string();
        let url = generate_url(&mut endpoint).unwrap();
        assert_eq!(url.as_str(), "wss://eu-west77.example.gg/?v=8");

        let mut bad = String::new();
        assert!(generate_url(&mut bad).is_err());
    }
}
