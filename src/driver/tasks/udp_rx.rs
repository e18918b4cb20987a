use super::message::*;
use crate::{
    constants::*,
    driver::{
        crypto::{Cipher, CryptoMode},
        Config,
        DriverStats,
    },
    id::UserId,
    input::DecoderStreams,
    receive::{PcmFrame, StreamHub},
};
use bytes::{Bytes, BytesMut};
use discortp::rtp::{MutableRtpPacket, RtpPacket};
use discortp::MutablePacket;
use flume::Receiver;
use std::{
    collections::{HashMap, VecDeque},
    io::{BufReader, Read, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, select, time::Instant};
use tracing::{error, instrument, trace, warn};

/// How long a silent remote stream keeps its decoder alive.
const USER_PRUNE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of disconnect application and unmapped-buffer expiry.
const CLEANUP_GAP: Duration = Duration::from_secs(1);

/// Per-SSRC receive state: identity binding, decoder child, liveness.
struct RemoteUser {
    user_id: UserId,
    decoder: Option<flume::Sender<Bytes>>,
    prune_time: Instant,
    disconnected: bool,
}

struct UdpRx {
    cipher: Cipher,
    crypto_mode: CryptoMode,
    users: HashMap<u32, RemoteUser>,
    pending: VecDeque<(Instant, u32, Bytes)>,
    config: Config,
    transcoder_path: Option<PathBuf>,
    warned_no_transcoder: bool,
    rx: Receiver<UdpRxMessage>,
    ssrc_signalling: Arc<SsrcTracker>,
    stats: Arc<DriverStats>,
    hub: Arc<StreamHub>,
    udp_socket: UdpSocket,
}

impl UdpRx {
    #[instrument(skip(self, interconnect))]
    async fn run(&mut self, interconnect: &mut Interconnect) {
        let mut cleanup_time = Instant::now() + CLEANUP_GAP;
        let mut byte_dest: Option<BytesMut> = None;

        loop {
            if byte_dest.is_none() {
                byte_dest = Some(BytesMut::zeroed(VOICE_PACKET_MAX));
            }

            select! {
                Ok((len, _addr)) = self.udp_socket.recv_from(byte_dest.as_mut().unwrap()) => {
                    let mut pkt = byte_dest.take().unwrap();
                    pkt.truncate(len);

                    self.process_udp_message(pkt);
                },
                msg = self.rx.recv_async() => {
                    match msg {
                        Ok(UdpRxMessage::SetCrypto(cipher, mode)) => {
                            self.cipher = cipher;
                            self.crypto_mode = mode;
                        },
                        Ok(UdpRxMessage::ReplaceInterconnect(i)) => {
                            *interconnect = i;
                        },
                        Ok(UdpRxMessage::Poison) | Err(flume::RecvError::Disconnected) => break,
                    }
                },
                () = tokio::time::sleep_until(cleanup_time) => {
                    self.cleanup(Instant::now());
                    cleanup_time = Instant::now() + CLEANUP_GAP;
                },
            }
        }
    }

    fn process_udp_message(&mut self, mut packet: BytesMut) {
        // NOTE: errors here are not fatal to the connection. Panics should be
        // avoided due to the adversarial nature of rx'd packets, but correct
        // handling should not prompt a reconnect.
        let (ssrc, plain_len) = {
            let Some(mut rtp) = MutableRtpPacket::new(packet.as_mut()) else {
                warn!("Illegal UDP packet from voice server.");
                return;
            };

            if !rtp_valid(&rtp.to_immutable()) {
                error!("Illegal RTP message received.");
                return;
            }

            match self.crypto_mode.decrypt_in_place(&mut rtp, &self.cipher) {
                Ok(n) => (rtp.get_ssrc(), n),
                Err(e) => {
                    self.stats.count_decrypt_failure();
                    warn!("RTP decryption failed: {:?}", e);
                    return;
                },
            }
        };

        let header_len = RtpPacket::minimum_packet_size();
        let plain = packet.freeze().slice(header_len..header_len + plain_len);

        let now = Instant::now();
        match self.lookup_user(ssrc) {
            Some(user_id) => self.feed(ssrc, user_id, plain, now),
            None => {
                trace!("Buffering {}B from unmapped SSRC {}.", plain.len(), ssrc);
                if self.pending.len() >= UNMAPPED_SSRC_LIMIT {
                    self.pending.pop_front();
                }
                self.pending.push_back((now, ssrc, plain));
            },
        }
    }

    /// Resolves an SSRC to a user, via live decode state or the bindings the
    /// WS task has picked up from SPEAKING frames.
    fn lookup_user(&self, ssrc: u32) -> Option<UserId> {
        if let Some(user) = self.users.get(&ssrc) {
            if !user.disconnected {
                return Some(user.user_id);
            }
        }

        self.ssrc_signalling
            .user_ssrc_map
            .iter()
            .find(|entry| *entry.value() == ssrc)
            .map(|entry| *entry.key())
    }

    fn feed(&mut self, ssrc: u32, user_id: UserId, data: Bytes, now: Instant) {
        let user = self.users.entry(ssrc).or_insert_with(|| RemoteUser {
            user_id,
            decoder: None,
            prune_time: now + USER_PRUNE_TIMEOUT,
            disconnected: false,
        });

        // Packet receipt pins decoder-state liveness to *speech*, not
        // mere presence.
        user.prune_time = now + USER_PRUNE_TIMEOUT;

        if !self.hub.has_listeners() {
            return;
        }

        if user.decoder.is_none() {
            user.decoder = spawn_decoder(
                &self.config,
                self.transcoder_path.as_deref(),
                &mut self.warned_no_transcoder,
                ssrc,
                user_id,
                &self.hub,
            );
        }

        match &user.decoder {
            Some(tx) =>
                if tx.send(data).is_err() {
                    warn!("Decoder for SSRC {ssrc} died; respawning on next packet.");
                    user.decoder = None;
                },
            // No transcoder available: deliver the raw Opus plaintext so
            // consumers still see the stream.
            None => self.hub.push(&PcmFrame {
                ssrc,
                user_id: Some(user_id),
                pcm: data,
            }),
        }
    }

    fn cleanup(&mut self, now: Instant) {
        // Apply any disconnects the WS task has signalled.
        loop {
            // This is structured in an odd way to prevent deadlocks: while-let
            // would keep the dashmap iter() alive for the whole block scope.
            let id = {
                if let Some(id) = self
                    .ssrc_signalling
                    .disconnected_users
                    .iter()
                    .next()
                    .map(|v| *v.key())
                {
                    id
                } else {
                    break;
                }
            };

            _ = self.ssrc_signalling.disconnected_users.remove(&id);
            _ = self.ssrc_signalling.speaking_states.remove(&id);
            if let Some((_, ssrc)) = self.ssrc_signalling.user_ssrc_map.remove(&id) {
                if let Some(state) = self.users.get_mut(&ssrc) {
                    // Don't clean up immediately: the decoder may still need
                    // to drain for a moment after the disconnect.
                    state.prune_time = now + Duration::from_secs(1);
                    state.disconnected = true;
                }
            }
        }

        // Rebind or expire datagrams buffered against unmapped SSRCs.
        let pending = std::mem::take(&mut self.pending);
        for (arrived, ssrc, data) in pending {
            if let Some(user_id) = self.lookup_user(ssrc) {
                self.feed(ssrc, user_id, data, now);
            } else if now.duration_since(arrived) < UNMAPPED_SSRC_TTL {
                self.pending.push_back((arrived, ssrc, data));
            }
        }

        // Now remove all dead SSRCs.
        self.users.retain(|_, v| v.prune_time > now);
    }
}

fn spawn_decoder(
    config: &Config,
    transcoder_path: Option<&std::path::Path>,
    warned: &mut bool,
    ssrc: u32,
    user_id: UserId,
    hub: &Arc<StreamHub>,
) -> Option<flume::Sender<Bytes>> {
    let Some(path) = transcoder_path else {
        if !*warned {
            warn!(
                "Transcoder {:?} not found on PATH; inbound audio is delivered undecoded.",
                config.transcoder.executable
            );
            *warned = true;
        }
        return None;
    };

    match config.transcoder.spawn_decoder(path) {
        Ok(streams) => Some(start_decoder_pump(streams, ssrc, user_id, hub.clone())),
        Err(e) => {
            warn!("Failed to spawn decoder for SSRC {ssrc}: {e:?}");
            None
        },
    }
}

/// Bridges one remote stream through its decoder child on blocking threads:
/// Opus frames in via a channel, PCM frames out to the hub.
fn start_decoder_pump(
    streams: DecoderStreams,
    ssrc: u32,
    user_id: UserId,
    hub: Arc<StreamHub>,
) -> flume::Sender<Bytes> {
    let (tx, rx) = flume::unbounded::<Bytes>();

    let DecoderStreams {
        container,
        stdout,
        mut stdin,
    } = streams;

    std::thread::spawn(move || {
        // Holding the container here ties child lifetime to the channel.
        let _container = container;

        while let Ok(frame) = rx.recv() {
            let len = frame.len().min(i16::MAX as usize);
            let written = stdin
                .write_all(&(len as i16).to_le_bytes())
                .and_then(|()| stdin.write_all(&frame[..len]));
            if written.is_err() {
                break;
            }
        }
    });

    std::thread::spawn(move || {
        let mut stdout = BufReader::new(stdout);
        let mut frame = vec![0u8; STEREO_FRAME_BYTE_SIZE];

        while stdout.read_exact(&mut frame).is_ok() {
            hub.push(&PcmFrame {
                ssrc,
                user_id: Some(user_id),
                pcm: Bytes::copy_from_slice(&frame),
            });
        }
    });

    tx
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub(crate) async fn runner(
    mut interconnect: Interconnect,
    rx: Receiver<UdpRxMessage>,
    cipher: Cipher,
    crypto_mode: CryptoMode,
    config: Config,
    udp_socket: UdpSocket,
    ssrc_signalling: Arc<SsrcTracker>,
    stats: Arc<DriverStats>,
    hub: Arc<StreamHub>,
) {
    trace!("UDP receive handle started.");

    let transcoder_path = config.transcoder.resolve();

    let mut state = UdpRx {
        cipher,
        crypto_mode,
        users: HashMap::new(),
        pending: VecDeque::new(),
        config,
        transcoder_path,
        warned_no_transcoder: false,
        rx,
        ssrc_signalling,
        stats,
        hub,
        udp_socket,
    };

    state.run(&mut interconnect).await;

    trace!("UDP receive handle stopped.");
}

#[inline]
fn rtp_valid(packet: &RtpPacket<'_>) -> bool {
    packet.get_version() == RTP_VERSION && packet.get_payload_type() == RTP_PROFILE_TYPE
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::crypto::{CryptoState, KEY_SIZE, TAG_SIZE};

    fn encrypted_packet(
        state: &mut CryptoState,
        cipher: &Cipher,
        ssrc: u32,
        payload: &[u8],
    ) -> BytesMut {
        let total = RtpPacket::minimum_packet_size() + payload.len() + TAG_SIZE + 4;
        let mut buf = BytesMut::zeroed(total);
        {
            let mut rtp = MutableRtpPacket::new(buf.as_mut()).unwrap();
            rtp.set_version(RTP_VERSION);
            rtp.set_payload_type(RTP_PROFILE_TYPE);
            rtp.set_sequence(1u16.into());
            rtp.set_timestamp(960u32.into());
            rtp.set_ssrc(ssrc);
            rtp.payload_mut()[..payload.len()].copy_from_slice(payload);
            state
                .encrypt_in_place(&mut rtp, cipher, payload.len())
                .unwrap();
        }
        buf
    }

    async fn fresh_rx() -> (UdpRx, Arc<StreamHub>, Arc<DriverStats>, Cipher) {
        let cipher = Cipher::new(CryptoMode::Aes256Gcm, &[1u8; KEY_SIZE]).unwrap();
        let hub = Arc::new(StreamHub::default());
        let stats = Arc::new(DriverStats::default());
        let (_keep, rx) = flume::unbounded();

        let state = UdpRx {
            cipher: cipher.clone(),
            crypto_mode: CryptoMode::Aes256Gcm,
            users: HashMap::new(),
            pending: VecDeque::new(),
            config: Config::default(),
            transcoder_path: None,
            warned_no_transcoder: true,
            rx,
            ssrc_signalling: Arc::new(SsrcTracker::default()),
            stats: stats.clone(),
            hub: hub.clone(),
            udp_socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        };

        (state, hub, stats, cipher)
    }

    #[tokio::test]
    async fn mapped_ssrc_reaches_streams_undecoded() {
        let (mut state, hub, _stats, cipher) = fresh_rx().await;
        let stream = hub.attach();

        let user = UserId::from(99);
        state.ssrc_signalling.user_ssrc_map.insert(user, 7);

        let mut crypto = CryptoState::from(CryptoMode::Aes256Gcm);
        let pkt = encrypted_packet(&mut crypto, &cipher, 7, &[0xAA, 0xBB]);
        state.process_udp_message(pkt);

        let frame = stream.recv().await.unwrap();
        assert_eq!(frame.ssrc, 7);
        assert_eq!(frame.user_id, Some(user));
        assert_eq!(&frame.pcm[..], &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn unmapped_ssrc_buffers_until_bound() {
        let (mut state, hub, _stats, cipher) = fresh_rx().await;
        let stream = hub.attach();

        let mut crypto = CryptoState::from(CryptoMode::Aes256Gcm);
        let pkt = encrypted_packet(&mut crypto, &cipher, 31, &[1, 2, 3]);
        state.process_udp_message(pkt);

        assert_eq!(state.pending.len(), 1);
        assert!(stream.try_recv().is_none());

        // A SPEAKING frame binds the SSRC; the next cleanup pass flushes.
        let user = UserId::from(5);
        state.ssrc_signalling.user_ssrc_map.insert(user, 31);
        state.cleanup(Instant::now());

        let frame = stream.recv().await.unwrap();
        assert_eq!(frame.user_id, Some(user));
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn unmapped_buffer_drops_oldest_and_expires() {
        let (mut state, _hub, _stats, cipher) = fresh_rx().await;

        let mut crypto = CryptoState::from(CryptoMode::Aes256Gcm);
        for i in 0..(UNMAPPED_SSRC_LIMIT + 3) {
            let pkt = encrypted_packet(&mut crypto, &cipher, 1000 + i as u32, &[i as u8]);
            state.process_udp_message(pkt);
        }

        assert_eq!(state.pending.len(), UNMAPPED_SSRC_LIMIT);
        assert_eq!(state.pending.front().unwrap().1, 1003);

        // Unbound entries evaporate once the hold window lapses.
        state.cleanup(Instant::now() + UNMAPPED_SSRC_TTL);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn tampered_packets_count_and_do_not_kill_state() {
        let (mut state, _hub, stats, cipher) = fresh_rx().await;

        let mut crypto = CryptoState::from(CryptoMode::Aes256Gcm);
        let mut pkt = encrypted_packet(&mut crypto, &cipher, 7, &[1, 2, 3, 4]);
        let last = pkt.len() - 5;
        pkt[last] ^= 0x40;

        state.process_udp_message(pkt);
        assert_eq!(stats.decrypt_failures(), 1);

        // A good packet afterwards is still accepted.
        let pkt = encrypted_packet(&mut crypto, &cipher, 7, &[1, 2, 3, 4]);
        state.process_udp_message(pkt);
        assert_eq!(stats.decrypt_failures(), 1);
        assert_eq!(state.pending.len(), 1);
    }

    #[tokio::test]
    async fn disconnects_prune_users_after_grace() {
        let (mut state, hub, _stats, cipher) = fresh_rx().await;
        let _stream = hub.attach();

        let user = UserId::from(44);
        state.ssrc_signalling.user_ssrc_map.insert(user, 9);

        let mut crypto = CryptoState::from(CryptoMode::Aes256Gcm);
        let pkt = encrypted_packet(&mut crypto, &cipher, 9, &[7]);
        state.process_udp_message(pkt);
        assert!(state.users.contains_key(&9));

        state.ssrc_signalling.disconnected_users.insert(user);
        let now = Instant::now();
        state.cleanup(now);
        assert!(state.users.get(&9).unwrap().disconnected);

        state.cleanup(now + Duration::from_secs(2));
        assert!(!state.users.contains_key(&9));
    }
}
