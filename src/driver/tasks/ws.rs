use super::message::*;
use crate::{
    driver::dave::MediaSecurityOverlay,
    events::{SpeakingUpdate, VoiceEvent},
    model::{
        payload::{DaveTransitionReady, Heartbeat, Speaking},
        CloseCode,
        Event,
        Frame,
        SpeakingState,
    },
    ws::{Error as WsError, WsStream},
};
use flume::Receiver;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Sentinel for "no server sequence seen yet".
pub(crate) const NO_SEQ: u64 = u64::MAX;

pub(crate) struct AuxNetwork {
    rx: Receiver<WsMessage>,
    ws_client: WsStream,
    dont_send: bool,

    ssrc: u32,
    heartbeat_interval: Duration,

    speaking: SpeakingState,
    heartbeat: HeartbeatState,
    last_seq: Arc<AtomicU64>,

    attempt_idx: usize,

    ssrc_signalling: Arc<SsrcTracker>,
    overlay: Box<dyn MediaSecurityOverlay>,
}

impl AuxNetwork {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        evt_rx: Receiver<WsMessage>,
        ws_client: WsStream,
        ssrc: u32,
        heartbeat_interval: f64,
        last_seq: Arc<AtomicU64>,
        attempt_idx: usize,
        ssrc_signalling: Arc<SsrcTracker>,
        overlay: Box<dyn MediaSecurityOverlay>,
    ) -> Self {
        Self {
            rx: evt_rx,
            ws_client,
            dont_send: false,

            ssrc,
            heartbeat_interval: Duration::from_secs_f64(heartbeat_interval / 1000.0),

            speaking: SpeakingState::empty(),
            heartbeat: HeartbeatState::new(Instant::now()),
            last_seq,

            attempt_idx,

            ssrc_signalling,
            overlay,
        }
    }

    #[instrument(skip(self, interconnect))]
    async fn run(&mut self, interconnect: &mut Interconnect) {
        let mut next_heartbeat = Instant::now() + self.heartbeat_interval;

        loop {
            let mut fault: Option<WsFault> = None;

            let hb = sleep_until(next_heartbeat);

            select! {
                () = hb => {
                    match self.heartbeat.tick(Instant::now(), self.seen_seq()) {
                        Tick::TimedOut => {
                            warn!("Two heartbeat intervals elapsed without an ack.");
                            fault = Some(WsFault::timeout());
                        },
                        Tick::Beat(beat) => {
                            drop(interconnect.events.send(EventMessage::Fire(
                                VoiceEvent::WsHeartbeat { t: beat.t, seq_ack: beat.seq_ack },
                            )));

                            if !self.dont_send {
                                trace!("Sent heartbeat {:?}", beat);
                                if let Err(e) = self.ws_client.send_json(&Event::from(beat)).await {
                                    fault = Some(WsFault::of(&e));
                                }
                            }
                        },
                    }
                    next_heartbeat = self.next_heartbeat();
                }
                ws_msg = self.ws_client.recv_json_no_timeout(), if !self.dont_send => {
                    match ws_msg {
                        Err(e) => fault = Some(WsFault::of(&e)),
                        Ok(Some(frame)) => {
                            if let Err(e) = self.process_frame(interconnect, frame).await {
                                fault = Some(WsFault::of(&e));
                            }
                        },
                        _ => {},
                    }
                }
                inner_msg = self.rx.recv_async() => {
                    match inner_msg {
                        Ok(WsMessage::Ws(data)) => {
                            self.ws_client = *data;
                            self.heartbeat.reset_socket();
                            next_heartbeat = self.next_heartbeat();
                            self.dont_send = false;
                        },
                        Ok(WsMessage::ReplaceInterconnect(i)) => {
                            *interconnect = i;
                        },
                        Ok(WsMessage::SetKeepalive(keepalive)) => {
                            self.heartbeat_interval = Duration::from_secs_f64(keepalive / 1000.0);
                            next_heartbeat = self.next_heartbeat();
                        },
                        Ok(WsMessage::Speaking(is_speaking)) => {
                            if let Err(e) = self.set_speaking(is_speaking).await {
                                fault = Some(WsFault::of(&e));
                            }
                        },
                        Ok(WsMessage::Poison) | Err(flume::RecvError::Disconnected) => {
                            break;
                        },
                    }
                }
            }

            if let Some(fault) = fault {
                self.dont_send = true;

                drop(interconnect.events.send(EventMessage::Fire(fault.event())));

                if fault.resumable {
                    drop(interconnect.core.send(CoreMessage::Reconnect));
                } else {
                    drop(interconnect.core.send(CoreMessage::SignalWsClosure(
                        self.attempt_idx,
                        fault.code,
                    )));
                    break;
                }
            }
        }
    }

    fn next_heartbeat(&self) -> Instant {
        Instant::now() + self.heartbeat_interval
    }

    fn seen_seq(&self) -> Option<u64> {
        let raw = self.last_seq.load(Ordering::Acquire);
        (raw != NO_SEQ).then_some(raw)
    }

    async fn set_speaking(&mut self, is_speaking: bool) -> Result<(), WsError> {
        if self.speaking.contains(SpeakingState::MICROPHONE) == is_speaking || self.dont_send {
            return Ok(());
        }

        self.speaking.set(SpeakingState::MICROPHONE, is_speaking);
        info!("Changing to {:?}", self.speaking);

        self.ws_client
            .send_json(&Event::from(Speaking {
                delay: Some(0),
                speaking: self.speaking,
                ssrc: self.ssrc,
                user_id: None,
            }))
            .await
    }

    async fn process_frame(
        &mut self,
        interconnect: &Interconnect,
        frame: Frame,
    ) -> Result<(), WsError> {
        if let Some(seq) = frame.seq {
            self.last_seq.store(seq, Ordering::Release);
        }

        drop(interconnect.events.send(EventMessage::Fire(
            VoiceEvent::WsMessage(frame.event.raw_op()),
        )));

        match frame.event {
            Event::Speaking(ev) => {
                if let Some(user_id) = ev.user_id {
                    self.ssrc_signalling.user_ssrc_map.insert(user_id, ev.ssrc);
                    self.ssrc_signalling
                        .speaking_states
                        .insert(user_id, ev.speaking);
                }

                drop(interconnect.events.send(EventMessage::Fire(
                    VoiceEvent::Speaking(SpeakingUpdate {
                        user_id: ev.user_id,
                        ssrc: ev.ssrc,
                        speaking: ev.speaking,
                    }),
                )));
            },
            Event::ClientsConnect(ev) => {
                for user_id in &ev.user_ids {
                    self.ssrc_signalling.disconnected_users.remove(user_id);
                }
                debug!("Clients connected: {:?}", ev.user_ids);
            },
            Event::ClientDisconnect(ev) => {
                self.ssrc_signalling.disconnected_users.insert(ev.user_id);

                drop(interconnect.events.send(EventMessage::Fire(
                    VoiceEvent::ClientDisconnect(ev.user_id),
                )));
            },
            Event::HeartbeatAck(ev) => {
                if let Some(latency) = self.heartbeat.acknowledge(ev.t, Instant::now()) {
                    trace!("Heartbeat ACK received, rtt {:?}.", latency);
                    drop(interconnect.events.send(EventMessage::Fire(
                        VoiceEvent::WsHeartbeatAck { latency },
                    )));
                    drop(interconnect.events.send(EventMessage::Fire(
                        VoiceEvent::WsPing(latency.as_millis() as u64),
                    )));
                } else {
                    warn!("Heartbeat ack did not match an in-flight beat (t={}).", ev.t);
                }
            },
            Event::SessionDescription(desc) => {
                // A description outside the handshake means the server rotated
                // mode/key (typically around an overlay transition).
                debug!("Mid-session re-key to mode {}.", desc.mode);
                drop(interconnect.core.send(CoreMessage::Rekey(desc)));
            },
            Event::DavePrepareTransition(ev) => {
                if self
                    .overlay
                    .prepare_transition(ev.transition_id, ev.protocol_version)
                {
                    self.send_transition_ready(ev.transition_id).await?;
                }
            },
            Event::DaveExecuteTransition(ev) => {
                self.overlay.execute_transition(ev.transition_id);
            },
            Event::DavePrepareEpoch(ev) => {
                debug!(
                    "Overlay epoch {} prepares protocol version {}.",
                    ev.epoch, ev.protocol_version
                );
            },
            Event::DaveBinary { op, payload } => match op {
                25..=27 => self.overlay.process_key_package(&payload),
                28..=30 => {
                    if let Some(transition_id) = self.overlay.process_commit_welcome(&payload) {
                        self.send_transition_ready(transition_id).await?;
                    }
                },
                _ => debug!("Unhandled binary overlay op {op}."),
            },
            Event::Resumed => {
                debug!("Late RESUMED frame outside a reconnect handshake.");
            },
            other => {
                debug!("Received other websocket data: {:?}", other);
            },
        }

        Ok(())
    }

    async fn send_transition_ready(&mut self, transition_id: u16) -> Result<(), WsError> {
        if self.dont_send {
            return Ok(());
        }

        self.ws_client
            .send_json(&Event::from(DaveTransitionReady { transition_id }))
            .await
    }
}

#[instrument(skip(interconnect, aux))]
pub(crate) async fn runner(mut interconnect: Interconnect, mut aux: AuxNetwork) {
    trace!("WS task started.");
    aux.run(&mut interconnect).await;
    trace!("WS task finished.");
}

/// Classification of a websocket fault: what to tell subscribers, and
/// whether the session supervisor should try to resume.
struct WsFault {
    resumable: bool,
    code: Option<u16>,
    message: String,
}

impl WsFault {
    fn of(err: &WsError) -> Self {
        match err {
            WsError::WsClosed(Some(frame)) => {
                let raw: u16 = frame.code.into();
                let resumable = CloseCode::from_u16(raw).map_or(true, CloseCode::should_resume);
                Self {
                    resumable,
                    code: Some(raw),
                    message: format!("websocket closed ({raw})"),
                }
            },
            WsError::WsClosed(None) => Self {
                resumable: true,
                code: None,
                message: "websocket closed".into(),
            },
            e => {
                debug!("Error sending/receiving ws {:?}.", e);
                Self {
                    resumable: true,
                    code: None,
                    message: format!("websocket fault: {e:?}"),
                }
            },
        }
    }

    fn timeout() -> Self {
        Self {
            resumable: true,
            code: None,
            message: "heartbeat timed out".into(),
        }
    }

    fn event(&self) -> VoiceEvent {
        match self.code {
            Some(code) => VoiceEvent::WsClose { code: Some(code) },
            None => VoiceEvent::WsError(self.message.clone()),
        }
    }
}

/// Heartbeat sequencing: at `heartbeat_interval` ticks produce a payload
/// bearing monotonic milliseconds and the last seen server sequence; acks
/// are matched by timestamp. Two consecutive unacknowledged intervals are a
/// transport fault.
pub(crate) struct HeartbeatState {
    epoch: Instant,
    sequence: u64,
    pending: Option<PendingBeat>,
    missed: u8,
}

struct PendingBeat {
    t: u64,
    sent: Instant,
}

pub(crate) enum Tick {
    Beat(Heartbeat),
    TimedOut,
}

impl HeartbeatState {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            sequence: 0,
            pending: None,
            missed: 0,
        }
    }

    /// Advances the beat timer, yielding the next payload to send or a
    /// timeout verdict.
    pub(crate) fn tick(&mut self, now: Instant, seq_ack: Option<u64>) -> Tick {
        if self.pending.is_some() {
            self.missed += 1;
            if self.missed >= 2 {
                return Tick::TimedOut;
            }
        }

        let t = now.duration_since(self.epoch).as_millis() as u64;
        self.pending = Some(PendingBeat { t, sent: now });
        self.sequence += 1;

        Tick::Beat(Heartbeat { t, seq_ack })
    }

    /// Matches an ack against the in-flight beat, yielding its round trip.
    pub(crate) fn acknowledge(&mut self, t: u64, now: Instant) -> Option<Duration> {
        let pending = self.pending.take()?;

        if pending.t == t {
            self.missed = 0;
            Some(now.duration_since(pending.sent))
        } else {
            self.pending = Some(pending);
            None
        }
    }

    /// Clears in-flight state after the socket is replaced.
    pub(crate) fn reset_socket(&mut self) {
        self.pending = None;
        self.missed = 0;
    }

    #[cfg(test)]
    fn beats_sent(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acked_beats_carry_rising_times_and_seq() {
        let start = Instant::now();
        let mut hb = HeartbeatState::new(start);
        let mut last_t = 0;

        for seq in 1..=3u64 {
            let now = start + Duration::from_secs(seq);

            let Tick::Beat(beat) = hb.tick(now, Some(seq)) else {
                panic!("beat expected");
            };
            assert!(beat.t > last_t);
            assert_eq!(beat.seq_ack, Some(seq));
            last_t = beat.t;

            let latency = hb
                .acknowledge(beat.t, now + Duration::from_millis(35))
                .unwrap();
            assert_eq!(latency, Duration::from_millis(35));
        }

        assert_eq!(hb.beats_sent(), 3);
    }

    #[test]
    fn two_unacked_intervals_time_out() {
        let now = Instant::now();
        let mut hb = HeartbeatState::new(now);

        assert!(matches!(hb.tick(now, None), Tick::Beat(_)));
        assert!(matches!(
            hb.tick(now + Duration::from_secs(1), None),
            Tick::Beat(_)
        ));
        assert!(matches!(
            hb.tick(now + Duration::from_secs(2), None),
            Tick::TimedOut
        ));
    }

    #[test]
    fn stale_acks_are_ignored() {
        let now = Instant::now();
        let mut hb = HeartbeatState::new(now);

        let Tick::Beat(first) = hb.tick(now, None) else {
            panic!("beat expected");
        };
        let Tick::Beat(_second) = hb.tick(now + Duration::from_secs(1), None) else {
            panic!("beat expected");
        };

        // An ack for the superseded beat must not clear the in-flight one.
        assert_eq!(hb.acknowledge(first.t.wrapping_sub(1), now), None);
        assert!(matches!(
            hb.tick(now + Duration::from_secs(2), None),
            Tick::TimedOut
        ));
    }

    #[test]
    fn socket_replacement_clears_misses() {
        let now = Instant::now();
        let mut hb = HeartbeatState::new(now);

        let _ = hb.tick(now, None);
        let _ = hb.tick(now + Duration::from_secs(1), None);
        hb.reset_socket();

        assert!(matches!(
            hb.tick(now + Duration::from_secs(2), None),
            Tick::Beat(_)
        ));
    }
}
