#![allow(missing_docs)]

use super::Interconnect;
use crate::driver::crypto::{Cipher, CryptoMode};

pub enum UdpRxMessage {
    SetCrypto(Cipher, CryptoMode),
    ReplaceInterconnect(Interconnect),

    Poison,
}
