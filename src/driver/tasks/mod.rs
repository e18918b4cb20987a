#![allow(missing_docs)]

pub mod error;
mod events;
pub mod message;
mod pipeline;
pub(crate) mod udp_rx;
pub(crate) mod udp_tx;
pub(crate) mod ws;

use super::{
    connection::Connection,
    crypto::{Cipher, CryptoMode},
    state::{SessionState, StateFlag},
    Config,
    DriverStats,
};
use crate::{
    constants::RECONNECT_DELAY,
    error::PlayError,
    events::{CloseInfo, ReadyInfo, VoiceEvent},
    receive::StreamHub,
};
use flume::{Receiver, RecvError, Sender};
use message::*;
use std::sync::Arc;
use tokio::{spawn, time::sleep};
use tracing::{error, info, instrument, trace, warn};

pub(crate) fn start(
    config: Config,
    rx: Receiver<CoreMessage>,
    tx: Sender<CoreMessage>,
    state: StateFlag,
    stats: Arc<DriverStats>,
    hub: Arc<StreamHub>,
) {
    spawn(async move {
        trace!("Driver started.");
        runner(config, rx, tx, state, stats, hub).await;
        trace!("Driver finished.");
    });
}

fn start_internals(core: Sender<CoreMessage>, config: Config) -> Interconnect {
    let (evt_tx, evt_rx) = flume::unbounded();
    let (pipe_tx, pipe_rx) = flume::unbounded();

    let interconnect = Interconnect {
        core,
        events: evt_tx,
        pipeline: pipe_tx,
    };

    let ic = interconnect.clone();
    spawn(async move {
        trace!("Event processor started.");
        events::runner(ic, evt_rx).await;
        trace!("Event processor finished.");
    });

    let ic = interconnect.clone();
    std::thread::spawn(move || {
        pipeline::runner(ic, pipe_rx, config);
    });

    interconnect
}

fn fire(interconnect: &Interconnect, event: VoiceEvent) {
    drop(interconnect.events.send(EventMessage::Fire(event)));
}

/// Drops the pipeline's links into a dead connection, which in turn poisons
/// the UDP tasks and kills any transmit subprocesses.
fn teardown(interconnect: &Interconnect) {
    drop(interconnect.pipeline.send(PipelineMessage::DropConn));
    drop(interconnect.pipeline.send(PipelineMessage::Ws(None)));
}

fn close_session(
    interconnect: &Interconnect,
    state: &StateFlag,
    connection: &mut Option<Connection>,
    code: Option<u16>,
    by_user: bool,
) {
    let had_conn = connection.take().is_some();
    teardown(interconnect);

    // close() is idempotent: a second call must not re-announce.
    if had_conn || state.get() != SessionState::Closed {
        state.set(SessionState::Closed);
        fire(interconnect, VoiceEvent::Closed(CloseInfo { code, by_user }));
    }
}

#[instrument(skip_all)]
async fn runner(
    config: Config,
    rx: Receiver<CoreMessage>,
    tx: Sender<CoreMessage>,
    state: StateFlag,
    stats: Arc<DriverStats>,
    hub: Arc<StreamHub>,
) {
    let mut connection: Option<Connection> = None;
    let mut attempt_idx: usize = 0;
    let mut interconnect = start_internals(tx, config.clone());

    loop {
        match rx.recv_async().await {
            Ok(CoreMessage::ConnectWithResult(info, result_tx)) => {
                attempt_idx += 1;
                connection = match Connection::new(
                    info,
                    &interconnect,
                    &config,
                    &state,
                    stats.clone(),
                    hub.clone(),
                    attempt_idx,
                )
                .await
                {
                    Ok(conn) => {
                        state.set(SessionState::Ready);
                        fire(
                            &interconnect,
                            VoiceEvent::Ready(ReadyInfo {
                                ssrc: conn.ssrc,
                                mode: conn.mode,
                            }),
                        );

                        // Other side may not be listening: this is fine.
                        let _ = result_tx.send(Ok(()));
                        Some(conn)
                    },
                    Err(why) => {
                        // Initial-connect faults belong to the caller, not the
                        // reconnect machinery.
                        state.set(SessionState::Idle);
                        fire(
                            &interconnect,
                            VoiceEvent::Error(format!("connection failed: {why}")),
                        );

                        let _ = result_tx.send(Err(why));
                        None
                    },
                };
            },
            Ok(CoreMessage::Disconnect) => {
                close_session(&interconnect, &state, &mut connection, None, true);
            },
            Ok(CoreMessage::Reconnect) => {
                if let Some(mut conn) = connection.take() {
                    state.set(SessionState::Reconnecting);
                    let mut failures: u8 = 0;

                    loop {
                        sleep(RECONNECT_DELAY).await;

                        match conn.reconnect(&config).await {
                            Ok(()) => {
                                state.set(SessionState::Ready);
                                fire(&interconnect, VoiceEvent::Resumed);
                                connection = Some(conn);
                                break;
                            },
                            Err(e) => {
                                warn!("Resume failed ({e}); retrying with a fresh identify.");
                                failures += 1;
                                if failures >= config.retry_limit {
                                    error!("Abandoning reconnection after {failures} failures.");
                                    fire(
                                        &interconnect,
                                        VoiceEvent::Error("reconnection attempts exhausted".into()),
                                    );
                                    close_session(
                                        &interconnect,
                                        &state,
                                        &mut connection,
                                        None,
                                        false,
                                    );
                                    break;
                                }
                            },
                        }

                        // The server rejected the resume: negotiate a brand
                        // new session on the stored credentials instead.
                        attempt_idx += 1;
                        match Connection::new(
                            conn.info.clone(),
                            &interconnect,
                            &config,
                            &state,
                            stats.clone(),
                            hub.clone(),
                            attempt_idx,
                        )
                        .await
                        {
                            Ok(new_conn) => {
                                state.set(SessionState::Ready);
                                fire(
                                    &interconnect,
                                    VoiceEvent::Ready(ReadyInfo {
                                        ssrc: new_conn.ssrc,
                                        mode: new_conn.mode,
                                    }),
                                );
                                connection = Some(new_conn);
                                break;
                            },
                            Err(e) => {
                                failures += 1;
                                if failures >= config.retry_limit {
                                    error!("Catastrophic connection failure: {e}. Stopping.");
                                    fire(
                                        &interconnect,
                                        VoiceEvent::Error("reconnection attempts exhausted".into()),
                                    );
                                    close_session(
                                        &interconnect,
                                        &state,
                                        &mut connection,
                                        None,
                                        false,
                                    );
                                    break;
                                }
                                state.set(SessionState::Reconnecting);
                            },
                        }
                    }

                    if connection.is_some() {
                        info!("Reconnection complete.");
                    }
                }
            },
            Ok(CoreMessage::SignalWsClosure(idx, code)) => {
                if connection.as_ref().is_some_and(|c| c.attempt_idx == idx) {
                    close_session(&interconnect, &state, &mut connection, code, false);
                }
            },
            Ok(CoreMessage::Rekey(desc)) => {
                if connection.is_some() {
                    let rebuilt = CryptoMode::from_request_str(&desc.mode)
                        .and_then(|m| Cipher::new(m, &desc.secret_key).ok().map(|c| (m, c)));

                    match rebuilt {
                        Some((mode, cipher)) => {
                            info!("Session re-keyed to {}.", desc.mode);
                            drop(
                                interconnect
                                    .pipeline
                                    .send(PipelineMessage::SetCrypto(cipher, mode.into())),
                            );
                        },
                        None => {
                            warn!("Server re-keyed to unusable mode {}; closing.", desc.mode);
                            fire(
                                &interconnect,
                                VoiceEvent::Error(format!("unusable re-key mode {}", desc.mode)),
                            );
                            close_session(&interconnect, &state, &mut connection, None, false);
                        },
                    }
                }
            },
            Ok(CoreMessage::FatalCrypto(e)) => {
                error!("Fatal packet-encryption fault: {e}.");
                fire(&interconnect, VoiceEvent::Error(format!("crypto fault: {e}")));
                close_session(&interconnect, &state, &mut connection, None, false);
            },
            Ok(CoreMessage::Play(source, result_tx)) => {
                if connection.is_some() {
                    if let Err(flume::SendError(PipelineMessage::Play(_, result_tx))) = interconnect
                        .pipeline
                        .send(PipelineMessage::Play(source, result_tx))
                    {
                        let _ = result_tx.send(Err(PlayError::Dropped));
                    }
                } else {
                    let _ = result_tx.send(Err(PlayError::NotConnected));
                }
            },
            Ok(CoreMessage::Pause) => {
                drop(interconnect.pipeline.send(PipelineMessage::Pause));
            },
            Ok(CoreMessage::ResumePlayback) => {
                drop(interconnect.pipeline.send(PipelineMessage::Resume));
            },
            Ok(CoreMessage::Stop) => {
                drop(interconnect.pipeline.send(PipelineMessage::Stop));
            },
            Ok(CoreMessage::SetVolume(volume)) => {
                drop(interconnect.pipeline.send(PipelineMessage::SetVolume(volume)));
            },
            Ok(CoreMessage::Mute(muted)) => {
                drop(interconnect.pipeline.send(PipelineMessage::SetMute(muted)));
            },
            Ok(CoreMessage::Subscribe(tx, filter)) => {
                drop(
                    interconnect
                        .events
                        .send(EventMessage::Subscribe(tx, filter)),
                );
            },
            Err(RecvError::Disconnected) | Ok(CoreMessage::Poison) => {
                break;
            },
        }
    }

    trace!("Main task exited");
    interconnect.poison_all();
}
