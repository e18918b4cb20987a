use super::{
    error::{Error, Result},
    message::*,
};
use crate::{
    constants::*,
    driver::{crypto::CryptoError, Config},
    error::{PlayError, PlayResult},
    input::{apply_gain, AudioSource, ChildContainer, FrameReader},
};
use discortp::rtp::{MutableRtpPacket, RtpPacket};
use discortp::{MutablePacket, Packet};
use flume::{Receiver, Sender, TryRecvError};
use rand::random;
use std::{
    io::{BufReader, ErrorKind, Read, Write},
    process::ChildStdin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{instrument, trace, warn};

/// The transmit half of the audio path, run on its own OS thread.
///
/// An external encoder child produces length-prefixed Opus frames; each
/// 20 ms tick takes one frame, wraps and encrypts it into the persistent
/// RTP packet buffer, and hands the datagram to the UDP tx task. Speech
/// edges manage the speaking flag and the trailing silence frames.
pub(crate) struct Pipeline {
    config: Config,
    conn_active: Option<PipelineConnection>,
    deadline: Instant,
    interconnect: Interconnect,
    rx: Receiver<PipelineMessage>,
    muted: bool,
    silence_frames: u8,
    speaking: bool,
    volume: Arc<AtomicU32>,
    ws: Option<Sender<WsMessage>>,
    playback: Option<Playback>,
    packet: [u8; VOICE_PACKET_MAX],
    frame: Vec<u8>,
}

struct Playback {
    frames: FrameReader<Box<dyn Read + Send>>,
    _children: ChildContainer,
    paused: bool,
    finished: bool,
}

impl Pipeline {
    fn new(interconnect: Interconnect, rx: Receiver<PipelineMessage>, config: Config) -> Self {
        Self {
            config,
            conn_active: None,
            deadline: Instant::now(),
            interconnect,
            rx,
            muted: false,
            silence_frames: 0,
            speaking: false,
            volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            ws: None,
            playback: None,
            packet: [0u8; VOICE_PACKET_MAX],
            frame: vec![0u8; VOICE_PACKET_MAX],
        }
    }

    fn run(&mut self) {
        loop {
            let ticking = self.conn_active.is_some()
                && self.playback.as_ref().is_some_and(|p| !p.paused);

            if ticking {
                loop {
                    match self.rx.try_recv() {
                        Ok(msg) =>
                            if self.handle(msg) {
                                return;
                            },
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }

                if let Err(e) = self.cycle() {
                    if let Some(fatal) = e.is_fatal_crypto() {
                        let _ = self
                            .interconnect
                            .core
                            .send(CoreMessage::FatalCrypto(fatal));
                        self.playback = None;
                        self.conn_active = None;
                    } else {
                        warn!("Transmit cycle failed: {:?}", e);
                        self.playback = None;
                    }
                }

                self.march_deadline();
            } else {
                match self.rx.recv() {
                    Ok(msg) =>
                        if self.handle(msg) {
                            return;
                        },
                    Err(_) => return,
                }
            }
        }
    }

    /// Returns `true` when the task should exit.
    fn handle(&mut self, msg: PipelineMessage) -> bool {
        match msg {
            PipelineMessage::Play(source, tx) => {
                let result = self.start_playback(source);
                if result.is_ok() {
                    self.deadline = Instant::now();
                }
                let _ = tx.send(result);
            },
            PipelineMessage::Pause =>
                if let Some(p) = &mut self.playback {
                    p.paused = true;
                },
            PipelineMessage::Resume =>
                if let Some(p) = &mut self.playback {
                    if p.paused {
                        p.paused = false;
                        self.deadline = Instant::now();
                    }
                },
            PipelineMessage::Stop =>
                if let Some(p) = &mut self.playback {
                    p.finished = true;
                    p.paused = false;
                },
            PipelineMessage::SetVolume(volume) => {
                self.volume
                    .store(volume.max(0.0).to_bits(), Ordering::Relaxed);
            },
            PipelineMessage::SetMute(muted) => self.muted = muted,
            PipelineMessage::SetConn(conn, ssrc) => {
                self.conn_active = Some(conn);

                let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
                    "Too few bytes in self.packet for RTP header.\
                        (Blame: VOICE_PACKET_MAX?)",
                );
                rtp.set_version(RTP_VERSION);
                rtp.set_payload_type(RTP_PROFILE_TYPE);
                rtp.set_ssrc(ssrc);
                rtp.set_sequence(random::<u16>().into());
                rtp.set_timestamp(random::<u32>().into());

                self.deadline = Instant::now();
            },
            PipelineMessage::SetCrypto(cipher, crypto_state) =>
                if let Some(conn) = &mut self.conn_active {
                    let _ = conn.udp_rx.send(UdpRxMessage::SetCrypto(
                        cipher.clone(),
                        crypto_state.kind(),
                    ));
                    conn.cipher = cipher;
                    conn.crypto_state = crypto_state;
                },
            PipelineMessage::Ws(ws) => self.ws = ws,
            PipelineMessage::DropConn => {
                self.conn_active = None;
                self.playback = None;
                self.speaking = false;
                self.silence_frames = 0;
            },
            PipelineMessage::ReplaceInterconnect(i) => self.interconnect = i,
            PipelineMessage::Poison => return true,
        }

        false
    }

    fn start_playback(&mut self, source: AudioSource) -> PlayResult<()> {
        if self.playback.is_some() {
            return Err(PlayError::AlreadyPlaying);
        }

        let exe = self.config.transcoder.resolve().ok_or_else(|| {
            PlayError::TranscoderMissing(self.config.transcoder.executable.clone())
        })?;

        let mut streams = self.config.transcoder.spawn_encoder(&exe, &source)?;

        if let AudioSource::Pcm(reader) = source {
            let stdin = streams.stdin.take().ok_or_else(|| {
                PlayError::Io(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "encoder lacks stdin for a PCM source",
                ))
            })?;
            let volume = self.volume.clone();
            thread::spawn(move || feed_pcm(reader, stdin, &volume));
        }

        self.playback = Some(Playback {
            frames: FrameReader::new(Box::new(BufReader::new(streams.stdout))),
            _children: streams.container,
            paused: false,
            finished: false,
        });

        Ok(())
    }

    fn cycle(&mut self) -> Result<()> {
        let mut opus_len = None;
        let mut finished = false;

        if let Some(playback) = &mut self.playback {
            if !playback.finished {
                match playback.frames.next_frame(&mut self.frame) {
                    Ok(Some(n)) => opus_len = Some(n),
                    Ok(None) => playback.finished = true,
                    Err(e) => {
                        warn!("Encoder stream ended abnormally: {e:?}");
                        playback.finished = true;
                    },
                }
            }
            finished = playback.finished;
        }

        // A muted session keeps cadence but submits nothing.
        if self.muted {
            opus_len = None;
        }

        match opus_len {
            Some(n) => {
                self.silence_frames = SILENT_FRAME_COUNT;
                self.set_speaking(true)?;
                self.write_and_send(n)?;
            },
            None =>
                if self.silence_frames > 0 {
                    // Per official guidelines, send the silence run BEFORE we
                    // stop speaking.
                    self.silence_frames -= 1;
                    self.frame[..SILENT_FRAME.len()].copy_from_slice(&SILENT_FRAME);
                    self.write_and_send(SILENT_FRAME.len())?;
                } else {
                    self.set_speaking(false)?;
                    if finished {
                        self.playback = None;
                    }
                },
        }

        Ok(())
    }

    fn write_and_send(&mut self, payload_len: usize) -> Result<()> {
        let conn = self
            .conn_active
            .as_mut()
            .expect("Shouldn't be ticking without access to a cipher + UDP dest.");

        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );
        rtp.payload_mut()[..payload_len].copy_from_slice(&self.frame[..payload_len]);

        let final_payload_size =
            conn.crypto_state
                .encrypt_in_place(&mut rtp, &conn.cipher, payload_len)?;

        let wire_len = RtpPacket::minimum_packet_size() + final_payload_size;
        conn.udp_tx
            .send(UdpTxMessage::Packet(self.packet[..wire_len].to_vec()))?;

        // Advance the persistent header for the next frame.
        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );
        rtp.set_sequence(rtp.get_sequence() + 1);
        rtp.set_timestamp(rtp.get_timestamp() + MONO_FRAME_SIZE as u32);

        Ok(())
    }

    fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        if self.speaking == speaking {
            return Ok(());
        }

        self.speaking = speaking;
        if let Some(ws) = &self.ws {
            ws.send(WsMessage::Speaking(speaking))?;
        }

        Ok(())
    }

    fn march_deadline(&mut self) {
        self.deadline += TIMESTEP_LENGTH;

        let now = Instant::now();
        match self.deadline.checked_duration_since(now) {
            Some(sleep_for) => thread::sleep(sleep_for),
            None => {
                // Way behind (e.g. a long pause): resync rather than burst.
                if now.duration_since(self.deadline) > 50 * TIMESTEP_LENGTH {
                    self.deadline = now;
                }
            },
        }
    }
}

/// Pumps a raw PCM source through the gain stage into the encoder's stdin.
///
/// Runs on its own thread; EOF or a broken pipe ends the pump, and closing
/// stdin lets the encoder flush its final frames.
fn feed_pcm(mut reader: Box<dyn Read + Send>, mut stdin: ChildStdin, volume: &AtomicU32) {
    let mut buf = vec![0u8; STEREO_FRAME_BYTE_SIZE];

    loop {
        let n = match read_fully(&mut reader, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("PCM source read failed: {e:?}");
                break;
            },
        };

        let gain = f32::from_bits(volume.load(Ordering::Relaxed));
        apply_gain(&mut buf[..n & !1], gain);

        if stdin.write_all(&buf[..n]).is_err() {
            break;
        }
    }
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[instrument(skip_all)]
pub(crate) fn runner(interconnect: Interconnect, pipe_rx: Receiver<PipelineMessage>, config: Config) {
    trace!("Pipeline thread started.");

    let mut pipeline = Pipeline::new(interconnect, pipe_rx, config);
    pipeline.run();

    trace!("Pipeline thread stopped.");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::crypto::{Cipher, CryptoMode, CryptoState, KEY_SIZE};
    use std::io::Cursor;

    fn test_pipeline() -> (
        Pipeline,
        Receiver<UdpTxMessage>,
        Receiver<WsMessage>,
        Cipher,
    ) {
        let (core_tx, _core_rx) = flume::unbounded();
        let (evt_tx, _evt_rx) = flume::unbounded();
        let (pipe_tx, pipe_rx) = flume::unbounded();
        // Keep the channel pair alive so the pipeline never sees a hangup.
        std::mem::forget(pipe_tx);

        let interconnect = Interconnect {
            core: core_tx,
            events: evt_tx,
            pipeline: flume::unbounded().0,
        };

        let mut pipeline = Pipeline::new(interconnect, pipe_rx, Config::default());

        let cipher = Cipher::new(CryptoMode::Aes256Gcm, &[9u8; KEY_SIZE]).unwrap();
        let (udp_tx_tx, udp_tx_rx) = flume::unbounded();
        let (udp_rx_tx, udp_rx_rx) = flume::unbounded();
        std::mem::forget(udp_rx_rx);

        let conn = PipelineConnection {
            cipher: cipher.clone(),
            crypto_state: CryptoState::from(CryptoMode::Aes256Gcm),
            udp_rx: udp_rx_tx,
            udp_tx: udp_tx_tx,
        };
        assert!(!pipeline.handle(PipelineMessage::SetConn(conn, 0xBEEF)));

        let (ws_tx, ws_rx) = flume::unbounded();
        pipeline.ws = Some(ws_tx);

        (pipeline, udp_tx_rx, ws_rx, cipher)
    }

    fn fake_playback(frames: &[&[u8]]) -> Playback {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend_from_slice(&(frame.len() as i16).to_le_bytes());
            bytes.extend_from_slice(frame);
        }

        Playback {
            frames: FrameReader::new(Box::new(Cursor::new(bytes))),
            _children: ChildContainer::default(),
            paused: false,
            finished: false,
        }
    }

    fn decrypt_sent(cipher: &Cipher, mut wire: Vec<u8>) -> (u16, u32, Vec<u8>) {
        let mut rtp = MutableRtpPacket::new(&mut wire[..]).unwrap();
        let len = CryptoMode::Aes256Gcm
            .decrypt_in_place(&mut rtp, cipher)
            .unwrap();
        let rtp = RtpPacket::new(&wire).unwrap();
        let seq: u16 = rtp.get_sequence().0.0;
        let ts: u32 = rtp.get_timestamp().0.0;
        (seq, ts, rtp.payload()[..len].to_vec())
    }

    #[test]
    fn burst_is_framed_by_speaking_and_silence() {
        let (mut pipeline, udp_rx, ws_rx, cipher) = test_pipeline();
        pipeline.playback = Some(fake_playback(&[&[1, 2, 3], &[4, 5]]));

        // 2 audio frames + 5 silence frames + the flag-drop tick.
        for _ in 0..8 {
            pipeline.cycle().unwrap();
        }

        assert!(matches!(ws_rx.try_recv(), Ok(WsMessage::Speaking(true))));

        let mut payloads = Vec::new();
        while let Ok(UdpTxMessage::Packet(p)) = udp_rx.try_recv() {
            payloads.push(decrypt_sent(&cipher, p).2);
        }
        assert_eq!(payloads.len(), 2 + usize::from(SILENT_FRAME_COUNT));
        assert_eq!(payloads[0], vec![1, 2, 3]);
        assert_eq!(payloads[1], vec![4, 5]);
        for silence in &payloads[2..] {
            assert_eq!(silence[..], SILENT_FRAME[..]);
        }

        assert!(matches!(ws_rx.try_recv(), Ok(WsMessage::Speaking(false))));
        assert!(pipeline.playback.is_none());
    }

    #[test]
    fn sequence_and_timestamp_rise_in_lockstep() {
        let (mut pipeline, udp_rx, _ws_rx, cipher) = test_pipeline();
        pipeline.playback = Some(fake_playback(&[&[1], &[2], &[3], &[4]]));

        for _ in 0..4 {
            pipeline.cycle().unwrap();
        }

        let mut headers = Vec::new();
        while let Ok(UdpTxMessage::Packet(p)) = udp_rx.try_recv() {
            let (seq, ts, _) = decrypt_sent(&cipher, p);
            headers.push((seq, ts));
        }

        assert_eq!(headers.len(), 4);
        for pair in headers.windows(2) {
            assert_eq!(pair[1].0, pair[0].0.wrapping_add(1));
            assert_eq!(pair[1].1, pair[0].1.wrapping_add(MONO_FRAME_SIZE as u32));
        }
    }

    #[test]
    fn nonce_suffixes_are_strictly_increasing() {
        let (mut pipeline, udp_rx, _ws_rx, _cipher) = test_pipeline();
        pipeline.playback = Some(fake_playback(&[&[1], &[2], &[3]]));

        for _ in 0..3 {
            pipeline.cycle().unwrap();
        }

        let mut nonces = Vec::new();
        while let Ok(UdpTxMessage::Packet(p)) = udp_rx.try_recv() {
            let tail = &p[p.len() - 4..];
            nonces.push(u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]));
        }

        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[test]
    fn pause_suspends_without_silence() {
        let (mut pipeline, udp_rx, ws_rx, _cipher) = test_pipeline();
        pipeline.playback = Some(fake_playback(&[&[1], &[2]]));

        pipeline.cycle().unwrap();
        assert!(matches!(ws_rx.try_recv(), Ok(WsMessage::Speaking(true))));
        assert!(udp_rx.try_recv().is_ok());

        assert!(!pipeline.handle(PipelineMessage::Pause));
        assert!(pipeline.playback.as_ref().unwrap().paused);
        // Paused sessions emit nothing: no packets, no flag change.
        assert!(udp_rx.try_recv().is_err());
        assert!(ws_rx.try_recv().is_err());
    }

    #[test]
    fn mute_keeps_cadence_but_sends_nothing_after_drain() {
        let (mut pipeline, udp_rx, _ws_rx, _cipher) = test_pipeline();
        pipeline.playback = Some(fake_playback(&[&[1], &[2], &[3]]));
        pipeline.muted = true;

        for _ in 0..10 {
            pipeline.cycle().unwrap();
        }

        // No speech was ever flagged, so no silence run is owed either.
        assert!(udp_rx.try_recv().is_err());
    }
}
