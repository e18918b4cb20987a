#![allow(missing_docs)]

mod core;
mod events;
mod pipeline;
mod udp_rx;
mod udp_tx;
mod ws;

pub use self::{core::*, events::*, pipeline::*, udp_rx::*, udp_tx::*, ws::*};

use crate::{id::UserId, model::SpeakingState};
use dashmap::{DashMap, DashSet};
use flume::Sender;
use tokio::spawn;
use tracing::trace;

#[derive(Clone, Debug)]
pub struct Interconnect {
    pub core: Sender<CoreMessage>,
    pub events: Sender<EventMessage>,
    pub pipeline: Sender<PipelineMessage>,
}

impl Interconnect {
    pub fn poison(&self) {
        drop(self.events.send(EventMessage::Poison));
    }

    pub fn poison_all(&self) {
        drop(self.pipeline.send(PipelineMessage::Poison));
        self.poison();
    }

    pub fn restart_volatile_internals(&mut self) {
        self.poison();

        let (evt_tx, evt_rx) = flume::unbounded();

        self.events = evt_tx;

        let ic = self.clone();
        spawn(async move {
            trace!("Event processor restarted.");
            super::events::runner(ic, evt_rx).await;
            trace!("Event processor finished.");
        });

        // Make the pipeline aware of new targets...
        drop(
            self.pipeline
                .send(PipelineMessage::ReplaceInterconnect(self.clone())),
        );
    }
}

/// Speaking-sourced SSRC bindings shared between the WS and UDP rx tasks.
///
/// The WS task writes (SPEAKING binds a user to an SSRC, CLIENT_DISCONNECT
/// queues an unbinding); the UDP rx task reads on its cleanup cycle.
#[derive(Debug, Default)]
pub struct SsrcTracker {
    pub user_ssrc_map: DashMap<UserId, u32>,
    pub speaking_states: DashMap<UserId, SpeakingState>,
    pub disconnected_users: DashSet<UserId>,
}
