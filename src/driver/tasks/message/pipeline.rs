#![allow(missing_docs)]

use super::{Interconnect, UdpRxMessage, UdpTxMessage, WsMessage};
use crate::{
    driver::crypto::{Cipher, CryptoState},
    error::PlayResult,
    input::AudioSource,
};
use flume::Sender;

/// Everything the transmit pipeline needs to reach a live connection.
pub struct PipelineConnection {
    pub cipher: Cipher,
    pub crypto_state: CryptoState,
    pub udp_rx: Sender<UdpRxMessage>,
    pub udp_tx: Sender<UdpTxMessage>,
}

impl Drop for PipelineConnection {
    fn drop(&mut self) {
        let _ = self.udp_rx.send(UdpRxMessage::Poison);
        let _ = self.udp_tx.send(UdpTxMessage::Poison);
    }
}

pub enum PipelineMessage {
    Play(AudioSource, Sender<PlayResult<()>>),
    Pause,
    Resume,
    Stop,

    SetVolume(f32),
    SetMute(bool),

    SetConn(PipelineConnection, u32),
    SetCrypto(Cipher, CryptoState),
    Ws(Option<Sender<WsMessage>>),
    DropConn,

    ReplaceInterconnect(Interconnect),

    Poison,
}
