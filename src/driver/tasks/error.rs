#![allow(missing_docs)]

use super::message::{CoreMessage, EventMessage, UdpTxMessage, WsMessage};
use crate::driver::crypto::CryptoError;
use flume::SendError;
use std::io::Error as IoError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recipient {
    AuxNetwork,
    Core,
    Event,
    Pipeline,
    UdpTx,
}

#[derive(Debug)]
pub enum Error {
    Crypto(CryptoError),
    Io(IoError),
    InterconnectFailure(Recipient),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this fault means packet encryption can never succeed again.
    pub fn is_fatal_crypto(&self) -> Option<CryptoError> {
        match self {
            Error::Crypto(e @ CryptoError::NonceExhausted) => Some(*e),
            _ => None,
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<SendError<WsMessage>> for Error {
    fn from(_: SendError<WsMessage>) -> Self {
        Error::InterconnectFailure(Recipient::AuxNetwork)
    }
}

impl From<SendError<CoreMessage>> for Error {
    fn from(_: SendError<CoreMessage>) -> Self {
        Error::InterconnectFailure(Recipient::Core)
    }
}

impl From<SendError<EventMessage>> for Error {
    fn from(_: SendError<EventMessage>) -> Self {
        Error::InterconnectFailure(Recipient::Event)
    }
}

impl From<SendError<UdpTxMessage>> for Error {
    fn from(_: SendError<UdpTxMessage>) -> Self {
        Error::InterconnectFailure(Recipient::UdpTx)
    }
}
