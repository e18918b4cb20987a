#![allow(missing_docs)]

use crate::{events::VoiceEvent, id::UserId};
use flume::Sender;

pub enum EventMessage {
    Fire(VoiceEvent),
    Subscribe(Sender<VoiceEvent>, Option<UserId>),

    Poison,
}
